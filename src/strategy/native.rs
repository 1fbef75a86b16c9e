//! 原生扩展思考策略：直接调用 Messages 端点
//!
//! 请求附带思考预算；回复中的 thinking / text / tool_use 块按此顺序重组后写回历史（thinking 块连同签名原样回传），
//! 同一回合的全部工具结果作为一条 user 消息的 tool_result 块列表发送。
//! 模型调用失败的处理与通用策略相同：瞬时失败按类别退避，连续失败达到上限或不可重试时返回错误交由 Agent 分类。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{CompletionRequest, LlmClient};
use crate::strategy::{
    request_completion, ExecutionOutcome, ExecutionStrategy, LoopSettings, LoopState,
    ProgressRecorder, SYSTEM_PROMPT,
};
use crate::tools::{ToolExecutor, ToolHost};

pub struct NativeStrategy {
    client: Arc<dyn LlmClient>,
    model: String,
    thinking_budget: u32,
    settings: LoopSettings,
}

impl NativeStrategy {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: &str,
        thinking_budget: u32,
        settings: LoopSettings,
    ) -> Self {
        Self {
            client,
            model: model.to_string(),
            thinking_budget,
            settings,
        }
    }
}

/// 回复块分拣
#[derive(Debug, Default)]
struct ReplyBlocks {
    thinking: Vec<Value>,
    text: Vec<Value>,
    tool_use: Vec<Value>,
}

impl ReplyBlocks {
    fn split(message: &Value) -> Self {
        let mut blocks = Self::default();
        let Some(content) = message.get("content").and_then(Value::as_array) else {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                blocks.text.push(json!({ "type": "text", "text": text }));
            }
            return blocks;
        };
        for block in content {
            match block.get("type").and_then(Value::as_str) {
                Some("thinking" | "redacted_thinking") => blocks.thinking.push(block.clone()),
                Some("text") => blocks.text.push(block.clone()),
                Some("tool_use") => blocks.tool_use.push(block.clone()),
                _ => {}
            }
        }
        blocks
    }

    /// 重组为 assistant 消息：thinking → text → tool_use
    fn assistant_message(&self) -> Value {
        let content: Vec<Value> = self
            .thinking
            .iter()
            .chain(&self.text)
            .chain(&self.tool_use)
            .cloned()
            .collect();
        json!({ "role": "assistant", "content": content })
    }
}

#[async_trait]
impl ExecutionStrategy for NativeStrategy {
    async fn run(
        &self,
        instruction: &str,
        host: &dyn ToolHost,
        progress: &ProgressRecorder,
    ) -> Result<ExecutionOutcome, AgentError> {
        let tools = host.list_tools(self.settings.tool_timeout).await?;
        let executor = ToolExecutor::new(host, self.settings.tool_timeout);
        let mut state = LoopState::new(instruction);
        state.snapshot(progress);

        let mut failures = 0u32;
        while state.turns < self.settings.max_turns {
            let request = CompletionRequest {
                model: &self.model,
                system: Some(SYSTEM_PROMPT),
                messages: &state.messages,
                tools: &tools,
                reasoning_effort: None,
                thinking_budget: Some(self.thinking_budget),
            };
            let Some(response) = request_completion(
                self.client.as_ref(),
                request,
                &self.settings,
                &mut failures,
            )
            .await?
            else {
                continue;
            };

            state.observe_model(response.model.as_deref());
            state.usage.add(&response.usage);
            let blocks = ReplyBlocks::split(&response.message);
            state.messages.push(blocks.assistant_message());
            state.turns += 1;
            state.snapshot(progress);

            if blocks.tool_use.is_empty() {
                tracing::info!(model = %self.model, turns = state.turns, "Agent finished");
                return Ok(state.finish(&self.model, None));
            }

            let mut results = Vec::with_capacity(blocks.tool_use.len());
            for block in &blocks.tool_use {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tracing::debug!(turn = state.turns, tool = %name, "Tool call");
                let (output, is_error) = match executor.execute(name, input).await {
                    Ok(text) => (text, false),
                    Err(e) => (format!("Error: {e}"), true),
                };
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": output,
                    "is_error": is_error,
                }));
            }
            state
                .messages
                .push(json!({ "role": "user", "content": results }));
            state.snapshot(progress);
        }

        tracing::warn!(model = %self.model, max_turns = self.settings.max_turns, "Turn limit reached");
        Ok(state.finish(
            &self.model,
            Some(format!("Max turns ({}) exceeded", self.settings.max_turns)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::anthropic_reply;
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::{FnTool, ToolRegistry};
    use crate::trajectory::Turn;

    fn registry() -> ToolRegistry {
        ToolRegistry::new("local").with_tool(FnTool::new("write", "Write", |_| Ok("written".into())))
    }

    #[tokio::test]
    async fn test_blocks_reordered_and_results_batched() {
        let mut reply = anthropic_reply(
            Some("plan"),
            Some("Writing both."),
            &[("t1", "write", json!({"path": "a"})), ("t2", "write", json!({"path": "b"}))],
        );
        // 乱序：tool_use 在前
        if let Some(content) = reply.message["content"].as_array_mut() {
            content.reverse();
        }
        let mock = Arc::new(
            MockLlmClient::new()
                .with_reply(reply)
                .with_reply(anthropic_reply(None, Some("done"), &[])),
        );
        let s = NativeStrategy::new(mock.clone(), "claude-4-sonnet", 4096, LoopSettings::default());
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.turn_count, 2);
        assert_eq!(outcome.resolved_model, "claude-mock");
        assert_eq!(outcome.token_usage.total_tokens, 60);

        let history = &mock.seen_messages()[1];
        let types: Vec<&str> = history[1]["content"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, ["thinking", "text", "tool_use", "tool_use"]);
        assert_eq!(history[2]["role"], "user");
        assert_eq!(history[2]["content"].as_array().unwrap().len(), 2);

        let t = outcome.trajectory.turns();
        assert_eq!(t[1], Turn::Assistant { content: "<think>\nplan\n</think>\n\nWriting both.".into() });
        assert_eq!(t.len(), 7);
        assert_eq!(t[6], Turn::Assistant { content: "done".into() });
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_backs_off_and_recovers() {
        let mock = Arc::new(
            MockLlmClient::new()
                .with_error(LlmError::Server { status: 502, message: "bad gateway".into() })
                .with_reply(anthropic_reply(None, Some("done"), &[])),
        );
        let s = NativeStrategy::new(mock.clone(), "claude-4-sonnet", 1024, LoopSettings::default());
        let start = tokio::time::Instant::now();
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(mock.call_count(), 2);
        assert_eq!(outcome.turn_count, 1);
        // 其他类失败：2^1
        assert_eq!(start.elapsed().as_secs(), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_returned_to_caller() {
        let mock = Arc::new(
            MockLlmClient::new().with_error(LlmError::ContextWindowExceeded("too long".into())),
        );
        let s = NativeStrategy::new(mock.clone(), "claude-4-sonnet", 1024, LoopSettings::default());
        let err = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::ContextWindowExceeded(_))));
        assert_eq!(mock.call_count(), 1);
    }
}
