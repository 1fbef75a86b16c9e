//! JSON-RPC 2.0 报文构造与解析（工具调用协议）

use serde_json::{json, Value};

use crate::tools::{ToolHostError, ToolSpec};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}

pub fn response(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {}
    })
}

pub fn call_params(name: &str, arguments: Value) -> Value {
    json!({
        "name": name,
        "arguments": match arguments {
            Value::Null => Value::Object(Default::default()),
            other => other,
        }
    })
}

/// 从响应中取 result；含 error 时转为 Rpc 错误
pub fn into_result(server: &str, message: Value) -> Result<Value, ToolHostError> {
    if let Some(err) = message.get("error") {
        return Err(ToolHostError::Rpc {
            server: server.to_string(),
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-32000),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(message.get("result").cloned().unwrap_or(Value::Null))
}

/// 解析 tools/list 结果：(工具列表, 下一页游标)
pub fn parse_tools(
    server: &str,
    result: &Value,
) -> Result<(Vec<ToolSpec>, Option<String>), ToolHostError> {
    let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
    let specs: Vec<ToolSpec> =
        serde_json::from_value(tools).map_err(|source| ToolHostError::InvalidJson {
            server: server.to_string(),
            source,
        })?;
    let cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(String::from);
    Ok((specs, cursor))
}

/// 解析 SSE 响应体中的 `data:` 事件（多行 data 按换行拼接）
pub fn parse_sse_messages(body: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut data = String::new();
    for line in body.lines().chain(std::iter::once("")) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            if !data.is_empty() {
                if let Ok(value) = serde_json::from_str::<Value>(&data) {
                    messages.push(value);
                }
                data.clear();
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        }
    }
    messages
}
