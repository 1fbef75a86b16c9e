//! Anthropic Messages API 客户端（扩展思考）
//!
//! 直接 POST /v1/messages；请求附带 thinking 预算，回复中的 thinking / text / tool_use 块原样保留，
//! 以便下一轮连同签名一起回传。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};

/// 未开启思考时的 max_tokens；开启时为 budget + 该值
const BASE_MAX_TOKENS: u32 = 4096;

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    version: String,
}

impl AnthropicClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        version: &str,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            version: version.to_string(),
        })
    }
}

/// 去掉路由前缀（如 "anthropic/claude-sonnet-4"）
pub fn api_model_name(model: &str) -> &str {
    model.strip_prefix("anthropic/").unwrap_or(model)
}

pub fn build_request_body(request: &CompletionRequest<'_>) -> Value {
    let max_tokens = request
        .thinking_budget
        .map(|b| (b + BASE_MAX_TOKENS).max(BASE_MAX_TOKENS))
        .unwrap_or(BASE_MAX_TOKENS);

    let mut body = json!({
        "model": api_model_name(request.model),
        "max_tokens": max_tokens,
        "messages": request.messages,
    });
    if let Some(system) = request.system {
        body["system"] = json!(system);
    }
    if let Some(budget) = request.thinking_budget {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!({ "type": "auto" });
    }
    body
}

pub fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
    let content = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| LlmError::Decode("response has no content blocks".to_string()))?;

    let input = body
        .pointer("/usage/input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = body
        .pointer("/usage/output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    Ok(CompletionResponse {
        model: body.get("model").and_then(Value::as_str).map(String::from),
        message: json!({ "role": "assistant", "content": content }),
        usage: TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            reasoning_tokens: 0,
        },
        finish_reason: body
            .get("stop_reason")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<CompletionResponse, LlmError> {
        let body = build_request_body(&request);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let text = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text));
        }
        let value: Value =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        parse_response(&value)
    }
}
