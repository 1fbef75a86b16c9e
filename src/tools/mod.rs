//! 工具层：工具宿主抽象、协议客户端（stdio / HTTP）、进程内注册表、执行器与各服务启动参数

pub mod executor;
pub mod host;
pub mod mcp;
pub mod registry;
pub mod services;

pub use executor::ToolExecutor;
pub use host::{is_error_result, render_result, ToolHost, ToolHostError, ToolSpec};
pub use registry::{FnTool, Tool, ToolRegistry};
pub use services::{launch_spec, HostSpec, McpLauncher, ServiceConfig, ToolHostLauncher};
