//! OpenAI 兼容 Chat Completions 客户端
//!
//! 通过 reqwest 直接调用任意 OpenAI 兼容端点（OpenAI、DeepSeek、Gemini OpenAI 兼容层、自建代理等），
//! 消息与工具调用保持 chat/completions 原生 JSON 形状。

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, TokenUsage};
use crate::tools::ToolSpec;

/// OpenAI 兼容客户端
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// 构造请求体（单独拆出便于测试）
pub fn build_request_body(request: &CompletionRequest<'_>) -> Value {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in request.messages {
        messages.push(strip_reasoning(message));
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        let gemini = is_gemini_model(request.model);
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| function_tool(tool, gemini))
            .collect();
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!("auto");
    }

    if let Some(effort) = request.reasoning_effort {
        if !effort.is_empty() && effort != "default" {
            body["reasoning_effort"] = json!(effort);
        }
    }
    body
}

fn function_tool(tool: &ToolSpec, gemini: bool) -> Value {
    let parameters = if gemini {
        simplify_schema_for_gemini(&tool.input_schema)
    } else {
        tool.input_schema.clone()
    };
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": parameters,
        }
    })
}

/// 回传历史时去掉 reasoning_content（部分端点拒绝该字段）
fn strip_reasoning(message: &Value) -> Value {
    match message {
        Value::Object(map) if map.contains_key("reasoning_content") => {
            let mut map = map.clone();
            map.remove("reasoning_content");
            Value::Object(map)
        }
        other => other.clone(),
    }
}

pub fn is_gemini_model(model: &str) -> bool {
    let lower = model.to_lowercase();
    lower.contains("gemini") || lower.contains("bison")
}

/// Gemini 不接受数组形式的 `type`，取第一个类型；递归处理嵌套 schema
pub fn simplify_schema_for_gemini(schema: &Value) -> Value {
    let Value::Object(map) = schema else {
        return schema.clone();
    };
    let mut out = Map::new();
    for (key, value) in map {
        let simplified = match (key.as_str(), value) {
            ("type", Value::Array(types)) => types
                .iter()
                .find(|t| t.as_str() != Some("null"))
                .or_else(|| types.first())
                .cloned()
                .unwrap_or_else(|| json!("string")),
            ("required" | "enum", _) => value.clone(),
            ("properties", Value::Object(props)) => Value::Object(
                props
                    .iter()
                    .map(|(k, v)| (k.clone(), simplify_schema_for_gemini(v)))
                    .collect(),
            ),
            (_, Value::Object(_)) => simplify_schema_for_gemini(value),
            (_, Value::Array(items)) => {
                Value::Array(items.iter().map(simplify_schema_for_gemini).collect())
            }
            _ => value.clone(),
        };
        out.insert(key.clone(), simplified);
    }
    Value::Object(out)
}

/// 解析 usage：输出 token = total - prompt（total > 0 时），否则用 completion_tokens
pub fn parse_usage(usage: Option<&Value>) -> TokenUsage {
    let Some(usage) = usage else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let input = field("prompt_tokens");
    let total = field("total_tokens");
    let output = if total > 0 {
        total.saturating_sub(input)
    } else {
        field("completion_tokens")
    };
    let reasoning = usage
        .pointer("/completion_tokens_details/reasoning_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        total_tokens: if total > 0 { total } else { input + output },
        reasoning_tokens: reasoning,
    }
}

/// 解析响应体为 CompletionResponse
pub fn parse_response(body: &Value) -> Result<CompletionResponse, LlmError> {
    let choice = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| LlmError::Decode("response has no choices".to_string()))?;
    let mut message = choice
        .get("message")
        .cloned()
        .ok_or_else(|| LlmError::Decode("choice has no message".to_string()))?;
    if let Value::Object(map) = &mut message {
        map.insert("role".to_string(), json!("assistant"));
        // 空 tool_calls 数组按无工具调用处理
        if map
            .get("tool_calls")
            .map(|v| v.is_null() || v.as_array().is_some_and(|a| a.is_empty()))
            .unwrap_or(false)
        {
            map.remove("tool_calls");
        }
    }
    Ok(CompletionResponse {
        model: body.get("model").and_then(Value::as_str).map(String::from),
        message,
        usage: parse_usage(body.get("usage")),
        finish_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(String::from),
    })
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<CompletionResponse, LlmError> {
        let body = build_request_body(&request);
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
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

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ToolSpec {
        ToolSpec {
            name: "write_file".to_string(),
            description: "Write a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": ["string", "null"]},
                    "lines": {"type": "array", "items": {"type": ["null", "integer"]}}
                },
                "required": ["path"]
            }),
        }
    }

    #[test]
    fn test_build_request_body() {
        let messages = vec![
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "ok", "reasoning_content": "hmm"}),
        ];
        let tools = vec![spec()];
        let req = CompletionRequest {
            model: "gpt-4.1",
            system: Some("sys"),
            messages: &messages,
            tools: &tools,
            reasoning_effort: Some("default"),
            thinking_budget: None,
        };
        let body = build_request_body(&req);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert!(body["messages"][2].get("reasoning_content").is_none());
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "write_file");
        assert_eq!(body["tool_choice"], "auto");
        assert!(body.get("reasoning_effort").is_none());
        // 非 Gemini 保持原 schema
        assert!(body["tools"][0]["function"]["parameters"]["properties"]["path"]["type"].is_array());
    }

    #[test]
    fn test_reasoning_effort_forwarded() {
        let req = CompletionRequest {
            model: "o3",
            system: None,
            messages: &[],
            tools: &[],
            reasoning_effort: Some("high"),
            thinking_budget: None,
        };
        let body = build_request_body(&req);
        assert_eq!(body["reasoning_effort"], "high");
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn test_gemini_schema_simplified() {
        let simplified = simplify_schema_for_gemini(&spec().input_schema);
        assert_eq!(simplified["properties"]["path"]["type"], "string");
        assert_eq!(simplified["properties"]["lines"]["items"]["type"], "integer");
        assert_eq!(simplified["required"], json!(["path"]));
        assert!(is_gemini_model("gemini-2.5-pro"));
        assert!(!is_gemini_model("gpt-4.1"));
    }

    #[test]
    fn test_parse_usage_prefers_total() {
        let usage = json!({
            "prompt_tokens": 100,
            "completion_tokens": 10,
            "total_tokens": 130,
            "completion_tokens_details": {"reasoning_tokens": 20}
        });
        let u = parse_usage(Some(&usage));
        assert_eq!(u.input_tokens, 100);
        assert_eq!(u.output_tokens, 30);
        assert_eq!(u.total_tokens, 130);
        assert_eq!(u.reasoning_tokens, 20);

        let u = parse_usage(Some(&json!({"prompt_tokens": 5, "completion_tokens": 7})));
        assert_eq!(u.output_tokens, 7);
        assert_eq!(u.total_tokens, 12);
    }

    #[test]
    fn test_parse_response_tool_calls() {
        let body = json!({
            "model": "gpt-4.1-2025-04-14",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "call_1", "type": "function",
                        "function": {"name": "write_file", "arguments": "{\"path\":\"x\"}"}}]
                }
            }],
            "usage": {"prompt_tokens": 1, "total_tokens": 2}
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.model.as_deref(), Some("gpt-4.1-2025-04-14"));
        assert_eq!(resp.message["role"], "assistant");
        assert_eq!(resp.message["tool_calls"][0]["id"], "call_1");
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));

        let empty = json!({"choices": [{"message": {"content": "done", "tool_calls": []}}]});
        let resp = parse_response(&empty).unwrap();
        assert!(resp.message.get("tool_calls").is_none());

        assert!(matches!(parse_response(&json!({})), Err(LlmError::Decode(_))));
    }
}
