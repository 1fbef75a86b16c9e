//! 通用策略：任意 chat/completions 兼容端点
//!
//! 历史以 OpenAI 消息形状保存；模型调用的瞬时失败（超时、限流、5xx、连接）按类别指数退避，
//! 连续失败达到上限即中止整个执行；不可重试的失败（上下文超限、鉴权、请求错误）立即中止。
//! 工具失败以 "Error: ..." 文本回写给模型，不中止执行。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::llm::{CompletionRequest, LlmClient};
use crate::strategy::{
    parse_tool_arguments, request_completion, ExecutionOutcome, ExecutionStrategy, LoopSettings,
    LoopState, ProgressRecorder, SYSTEM_PROMPT,
};
use crate::tools::{ToolExecutor, ToolHost};

pub struct GenericStrategy {
    client: Arc<dyn LlmClient>,
    model: String,
    reasoning_effort: Option<String>,
    settings: LoopSettings,
}

impl GenericStrategy {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: &str,
        reasoning_effort: Option<String>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            client,
            model: model.to_string(),
            reasoning_effort,
            settings,
        }
    }
}

/// 回复中的工具调用：(call_id, name, 原始 arguments)
///
/// 缺少 id 的调用在此补上 `call_{turn}_{i}` 并写回消息，历史与轨迹使用同一个 id。
fn tool_calls(message: &mut Value, turn: u32) -> Vec<(String, String, Option<Value>)> {
    let Some(calls) = message.get_mut("tool_calls").and_then(Value::as_array_mut) else {
        return Vec::new();
    };
    calls
        .iter_mut()
        .enumerate()
        .map(|(i, call)| {
            let existing = call
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(String::from);
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = format!("call_{turn}_{i}");
                    if let Some(obj) = call.as_object_mut() {
                        obj.insert("id".to_string(), json!(id));
                    }
                    id
                }
            };
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = function.and_then(|f| f.get("arguments")).cloned();
            (id, name, arguments)
        })
        .collect()
}

#[async_trait]
impl ExecutionStrategy for GenericStrategy {
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
                reasoning_effort: self.reasoning_effort.as_deref(),
                thinking_budget: None,
            };
            let Some(mut response) = request_completion(
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
            state.turns += 1;
            let calls = tool_calls(&mut response.message, state.turns);
            state.messages.push(response.message);
            state.snapshot(progress);

            if calls.is_empty() {
                tracing::info!(model = %self.model, turns = state.turns, "Agent finished");
                return Ok(state.finish(&self.model, None));
            }

            for (call_id, name, raw_args) in calls {
                tracing::debug!(turn = state.turns, tool = %name, "Tool call");
                let output = match parse_tool_arguments(raw_args.as_ref()) {
                    Ok(args) => match executor.execute(&name, args).await {
                        Ok(text) => text,
                        Err(e) => format!("Error: {e}"),
                    },
                    Err(e) => format!("Error: {e}"),
                };
                state.messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }));
            }
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
    use crate::llm::mock::{text_reply, tool_call_reply};
    use crate::llm::{LlmError, MockLlmClient};
    use crate::tools::{FnTool, ToolRegistry};
    use crate::trajectory::Turn;

    fn registry() -> ToolRegistry {
        ToolRegistry::new("local")
            .with_tool(FnTool::new("write", "Write a file", |_| Ok("ok".into())))
            .with_tool(FnTool::new("fail", "Always fails", |_| Err("disk full".into())))
    }

    fn strategy(mock: MockLlmClient, settings: LoopSettings) -> (Arc<MockLlmClient>, GenericStrategy) {
        let mock = Arc::new(mock);
        let s = GenericStrategy::new(mock.clone(), "gpt-4o", None, settings);
        (mock, s)
    }

    #[tokio::test]
    async fn test_tool_failure_reported_to_model() {
        let (mock, s) = strategy(
            MockLlmClient::new()
                .with_reply(tool_call_reply("c1", "fail", json!({})))
                .with_reply(text_reply("gave up")),
            LoopSettings::default(),
        );
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.turn_count, 2);
        assert_eq!(
            outcome.trajectory.turns()[2],
            Turn::ToolResult {
                call_id: "c1".into(),
                output: "Error: Tool execution failed: disk full".into()
            }
        );
        let second_call = &mock.seen_messages()[1];
        assert_eq!(second_call.last().unwrap()["role"], "tool");
    }

    #[tokio::test]
    async fn test_unknown_tool_does_not_abort() {
        let (_, s) = strategy(
            MockLlmClient::new()
                .with_reply(tool_call_reply("c1", "nope", json!({})))
                .with_reply(text_reply("done")),
            LoopSettings::default(),
        );
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();
        assert!(outcome.success);
        let Turn::ToolResult { output, .. } = &outcome.trajectory.turns()[2] else {
            panic!("Expected tool result");
        };
        assert!(output.starts_with("Error:"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_recover() {
        let (mock, s) = strategy(
            MockLlmClient::new()
                .with_error(LlmError::RateLimited { message: "slow down".into(), retry_after_secs: None })
                .with_error(LlmError::Timeout("slow".into()))
                .with_reply(text_reply("done")),
            LoopSettings::default(),
        );
        let start = tokio::time::Instant::now();
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(mock.call_count(), 3);
        // 12^1 + 8^2
        assert_eq!(start.elapsed().as_secs(), 76);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_abort() {
        let (mock, s) = strategy(
            MockLlmClient::new()
                .with_error(LlmError::Server { status: 502, message: "bad gateway".into() })
                .with_error(LlmError::Server { status: 502, message: "bad gateway".into() })
                .with_error(LlmError::Server { status: 503, message: "unavailable".into() }),
            LoopSettings::default(),
        );
        let err = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::TooManyFailures { attempts: 3, .. }));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_aborts_immediately() {
        let (mock, s) = strategy(
            MockLlmClient::new()
                .with_error(LlmError::ContextWindowExceeded("too long".into())),
            LoopSettings::default(),
        );
        let err = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Llm(LlmError::ContextWindowExceeded(_))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_call_id_shared_by_history_and_trajectory() {
        let mut reply = tool_call_reply("unused", "write", json!({}));
        if let Some(call) = reply.message["tool_calls"][0].as_object_mut() {
            call.remove("id");
        }
        let (mock, s) = strategy(
            MockLlmClient::new().with_reply(reply).with_reply(text_reply("done")),
            LoopSettings::default(),
        );
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();

        let t = outcome.trajectory.turns();
        let Turn::ToolCall { call_id, .. } = &t[1] else {
            panic!("Expected tool call, got {:?}", t[1]);
        };
        let Turn::ToolResult { call_id: result_id, .. } = &t[2] else {
            panic!("Expected tool result, got {:?}", t[2]);
        };
        assert_eq!(call_id, "call_1_0");
        assert_eq!(call_id, result_id);

        let history = &mock.seen_messages()[1];
        assert_eq!(history[1]["tool_calls"][0]["id"], "call_1_0");
        assert_eq!(history[2]["tool_call_id"], "call_1_0");
    }

    #[tokio::test]
    async fn test_invalid_arguments_become_error_result() {
        let mut reply = tool_call_reply("c1", "write", json!({}));
        reply.message["tool_calls"][0]["function"]["arguments"] = json!("{not json");
        let (_, s) = strategy(
            MockLlmClient::new().with_reply(reply).with_reply(text_reply("done")),
            LoopSettings::default(),
        );
        let outcome = s.run("go", &registry(), &ProgressRecorder::new()).await.unwrap();
        let Turn::ToolResult { output, .. } = &outcome.trajectory.turns()[2] else {
            panic!("Expected tool result");
        };
        assert!(output.starts_with("Error: Invalid tool arguments"));
    }
}
