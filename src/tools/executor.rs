//! 工具执行器
//!
//! 包装一个 ToolHost 与单次调用超时，execute(tool_name, args) 返回渲染后的文本；
//! 超时或失败时转为 AgentError（ToolTimeout / ToolExecutionFailed）；每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::core::AgentError;
use crate::tools::{is_error_result, render_result, ToolHost, ToolHostError};

/// 工具执行器：对每次调用施加超时，并将结果映射为 AgentError
pub struct ToolExecutor<'a> {
    host: &'a dyn ToolHost,
    timeout: Duration,
}

impl<'a> ToolExecutor<'a> {
    pub fn new(host: &'a dyn ToolHost, timeout: Duration) -> Self {
        Self { host, timeout }
    }

    /// 执行指定工具；外层再加一道超时，防止宿主实现忽略传入的超时
    pub async fn execute(&self, tool_name: &str, args: Value) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = tokio::time::timeout(
            self.timeout,
            self.host.call_tool(tool_name, args, self.timeout),
        )
        .await;

        let mapped = match result {
            Ok(Ok(value)) if is_error_result(&value) => {
                Err(AgentError::ToolExecutionFailed(render_result(&value)))
            }
            Ok(Ok(value)) => Ok(render_result(&value)),
            Ok(Err(ToolHostError::Timeout { .. })) | Err(_) => {
                Err(AgentError::ToolTimeout(tool_name.to_string()))
            }
            Ok(Err(e)) => Err(AgentError::ToolExecutionFailed(e.to_string())),
        };

        let outcome = match &mapped {
            Ok(_) => "ok",
            Err(AgentError::ToolTimeout(_)) => "timeout",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "host": self.host.name(),
            "tool": tool_name,
            "ok": mapped.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        mapped
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{FnTool, ToolRegistry};
    use serde_json::json;

    #[tokio::test]
    async fn test_execute_ok_and_failure() {
        let registry = ToolRegistry::new("local")
            .with_tool(FnTool::new("echo", "Echo", |a: Value| Ok(a.to_string())))
            .with_tool(FnTool::new("bad", "Bad", |_| Err("disk full".into())));
        let exec = ToolExecutor::new(&registry, Duration::from_secs(5));

        assert_eq!(exec.execute("echo", json!(1)).await.unwrap(), "1");
        match exec.execute("bad", json!({})).await {
            Err(AgentError::ToolExecutionFailed(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("Expected ToolExecutionFailed, got {other:?}"),
        }
        match exec.execute("ghost", json!({})).await {
            Err(AgentError::ToolExecutionFailed(msg)) => assert!(msg.contains("Unknown tool")),
            other => panic!("Expected ToolExecutionFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_args_preview_truncates() {
        let long = json!({"text": "x".repeat(500)});
        let preview = args_preview(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.chars().count(), 203);
    }
}
