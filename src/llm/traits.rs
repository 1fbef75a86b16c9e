//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Anthropic / Mock）实现 LlmClient：每回合一次请求-响应，无长连接事件流。
//! 消息以各提供方原生 JSON 形状传递，统一形状的转换只在 trajectory::normalize 中进行。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::tools::ToolSpec;

/// 单次补全请求
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system: Option<&'a str>,
    /// 提供方原生消息（不含 system）
    pub messages: &'a [Value],
    pub tools: &'a [ToolSpec],
    /// OpenAI 兼容端点的 reasoning_effort；"default" 或 None 表示不发送
    pub reasoning_effort: Option<&'a str>,
    /// Anthropic 扩展思考预算（token）
    pub thinking_budget: Option<u32>,
}

/// 单次补全响应
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// 提供方回报的模型名
    pub model: Option<String>,
    /// 提供方原生的 assistant 消息
    pub message: Value,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0 && self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// 回合内失败的退避类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    RateLimit,
    /// 其他瞬时失败（5xx、连接、响应解析）
    Transient,
    /// 不可重试（上下文超限、鉴权、请求错误）
    Permanent,
}

/// 模型调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Rate limit exceeded (429): {message}")]
    RateLimited {
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Context window exceeded: {0}")]
    ContextWindowExceeded(String),

    #[error("Authentication failed (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Bad request (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl LlmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LlmError::Timeout(_) => FailureKind::Timeout,
            LlmError::RateLimited { .. } => FailureKind::RateLimit,
            LlmError::Server { .. } | LlmError::Network(_) | LlmError::Decode(_) => {
                FailureKind::Transient
            }
            LlmError::ContextWindowExceeded(_)
            | LlmError::Auth { .. }
            | LlmError::Api { .. }
            | LlmError::Config(_) => FailureKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() != FailureKind::Permanent
    }

    /// 按 HTTP 状态码与响应体映射错误
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = error_message_from_body(body);
        let lower = body.to_lowercase();
        if lower.contains("context_length_exceeded")
            || lower.contains("context length")
            || lower.contains("maximum context")
            || lower.contains("prompt is too long")
            || lower.contains("context window")
        {
            return LlmError::ContextWindowExceeded(message);
        }
        match status {
            401 | 403 => LlmError::Auth { status, message },
            408 => LlmError::Timeout(message),
            429 => LlmError::RateLimited {
                message,
                retry_after_secs: None,
            },
            500..=599 => LlmError::Server { status, message },
            _ => LlmError::Api { status, message },
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(err.to_string())
        } else if err.is_decode() {
            LlmError::Decode(err.to_string())
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

/// 取出 `{"error": {"message": ...}}` 中的消息，失败时返回截断后的原文
fn error_message_from_body(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| body.chars().take(500).collect())
}

/// LLM 客户端 trait：一次请求、一次完整回复
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest<'_>) -> Result<CompletionResponse, LlmError>;
}

/// 对单次调用施加超时，超时转为 LlmError::Timeout
pub async fn complete_with_timeout(
    client: &dyn LlmClient,
    request: CompletionRequest<'_>,
    limit: Duration,
) -> Result<CompletionResponse, LlmError> {
    match tokio::time::timeout(limit, client.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(format!(
            "model call exceeded {} seconds",
            limit.as_secs()
        ))),
    }
}
