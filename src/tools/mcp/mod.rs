//! 工具调用协议客户端：JSON-RPC 2.0，子进程（stdio）与 HTTP 两种传输

pub mod http;
pub mod protocol;
pub mod stdio;

pub use http::{HttpSpec, HttpToolHost};
pub use stdio::{StdioSpec, StdioToolHost};
