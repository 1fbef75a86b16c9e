//! 工具宿主抽象
//!
//! 工具宿主是为模型执行具名动作的外部进程或 HTTP 端点：`list_tools` 与 `call_tool` 各自带独立超时，
//! 传输方式（子进程管道 / HTTP）对 Agent 透明。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 工具描述（名称、描述、输入 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {}, "required": [] })
}

/// 工具宿主错误
#[derive(Debug, Error)]
pub enum ToolHostError {
    #[error("MCP server '{server}' is not configured: {message}")]
    NotConfigured { server: String, message: String },

    #[error("failed to spawn MCP server '{server}': {source}")]
    Spawn {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MCP server '{server}' transport error: {message}")]
    Transport { server: String, message: String },

    #[error("MCP server '{server}' returned invalid JSON: {source}")]
    InvalidJson {
        server: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("MCP server '{server}' returned JSON-RPC error {code}: {message}")]
    Rpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP server '{server}' terminated unexpectedly")]
    Terminated { server: String },

    #[error("MCP server '{server}' timed out during {operation}")]
    Timeout { server: String, operation: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),
}

/// 工具宿主客户端
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// 宿主名（通常为服务名）
    fn name(&self) -> &str;

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolSpec>, ToolHostError>;

    /// 调用工具，返回协议原生结果（`{"content": [...], "isError": bool}`）
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolHostError>;

    /// 关闭会话（子进程 / HTTP 会话）
    async fn close(&self) -> Result<(), ToolHostError> {
        Ok(())
    }
}

/// 将工具结果渲染为文本：拼接 content 中的文本项，非文本项以 JSON 表示
pub fn render_result(result: &Value) -> String {
    match result.get("content") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item.get("text").and_then(Value::as_str) {
                Some(text) => text.to_string(),
                None => item.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => match result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        },
    }
}

/// 结果是否标记为错误
pub fn is_error_result(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
