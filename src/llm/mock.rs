//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预设回复或错误；脚本耗尽后返回 fallback（未设置时回复 "Task completed"）。
//! 记录每次请求收到的消息，便于断言对话历史。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    fallback: Option<CompletionResponse>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Value>>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(self, reply: CompletionResponse) -> Self {
        self.push(Ok(reply));
        self
    }

    pub fn with_error(self, err: LlmError) -> Self {
        self.push(Err(err));
        self
    }

    /// 脚本耗尽后重复返回的回复
    pub fn with_fallback(mut self, reply: CompletionResponse) -> Self {
        self.fallback = Some(reply);
        self
    }

    fn push(&self, item: Result<CompletionResponse, LlmError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(item);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的消息历史
    pub fn seen_messages(&self) -> Vec<Vec<Value>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.messages.to_vec());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match next {
            Some(item) => item,
            None => Ok(self
                .fallback
                .clone()
                .unwrap_or_else(|| text_reply("Task completed"))),
        }
    }
}

fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: input + output,
        reasoning_tokens: 0,
    }
}

/// chat/completions 形状的纯文本回复
pub fn text_reply(text: &str) -> CompletionResponse {
    CompletionResponse {
        model: Some("mock-model".to_string()),
        message: json!({ "role": "assistant", "content": text }),
        usage: usage(10, 5),
        finish_reason: Some("stop".to_string()),
    }
}

/// chat/completions 形状的单个工具调用回复
pub fn tool_call_reply(call_id: &str, name: &str, arguments: Value) -> CompletionResponse {
    CompletionResponse {
        model: Some("mock-model".to_string()),
        message: json!({
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": call_id,
                "type": "function",
                "function": { "name": name, "arguments": arguments.to_string() }
            }]
        }),
        usage: usage(10, 5),
        finish_reason: Some("tool_calls".to_string()),
    }
}

/// Messages API 形状的回复：可选 thinking、可选 text、若干 tool_use
pub fn anthropic_reply(
    thinking: Option<&str>,
    text: Option<&str>,
    tool_uses: &[(&str, &str, Value)],
) -> CompletionResponse {
    let mut content = Vec::new();
    if let Some(t) = thinking {
        content.push(json!({ "type": "thinking", "thinking": t, "signature": "mock-signature" }));
    }
    if let Some(t) = text {
        content.push(json!({ "type": "text", "text": t }));
    }
    for (id, name, input) in tool_uses {
        content.push(json!({ "type": "tool_use", "id": id, "name": name, "input": input }));
    }
    CompletionResponse {
        model: Some("claude-mock".to_string()),
        message: json!({ "role": "assistant", "content": content }),
        usage: usage(20, 10),
        finish_reason: Some(if tool_uses.is_empty() { "end_turn" } else { "tool_use" }.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_then_fallback() {
        let mock = MockLlmClient::new()
            .with_reply(tool_call_reply("c1", "echo", json!({"text": "hi"})))
            .with_error(LlmError::Timeout("slow".into()));
        let req = CompletionRequest {
            model: "m",
            system: None,
            messages: &[json!({"role": "user", "content": "x"})],
            tools: &[],
            reasoning_effort: None,
            thinking_budget: None,
        };
        assert!(mock.complete(req).await.unwrap().message.get("tool_calls").is_some());
        assert!(mock.complete(req).await.is_err());
        let last = mock.complete(req).await.unwrap();
        assert_eq!(last.message["content"], "Task completed");
        assert_eq!(mock.call_count(), 3);
        assert_eq!(mock.seen_messages().len(), 3);
    }
}
