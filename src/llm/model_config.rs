//! 模型配置：短名 → 提供方、真实模型名、API Key / Base URL 环境变量
//!
//! - 已知短名查表（如 `gpt-4.1` → `gpt-4.1-2025-04-14`）
//! - 未登记的模型可写成 `provider/model`（如 `openrouter/qwen/qwen3-max`）
//! - 缺少 API Key 时返回 config-missing 错误

use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmSection;
use crate::core::BenchError;
use crate::llm::{AnthropicClient, LlmClient, OpenAiClient};

/// 提供方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    DeepSeek,
    Gemini,
    OpenRouter,
}

impl Provider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "anthropic" => Some(Provider::Anthropic),
            "deepseek" => Some(Provider::DeepSeek),
            "gemini" | "google" => Some(Provider::Gemini),
            "openrouter" => Some(Provider::OpenRouter),
            _ => None,
        }
    }

    pub fn api_key_var(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    pub fn base_url_var(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_BASE_URL",
            Provider::Anthropic => "ANTHROPIC_BASE_URL",
            Provider::DeepSeek => "DEEPSEEK_BASE_URL",
            Provider::Gemini => "GEMINI_BASE_URL",
            Provider::OpenRouter => "OPENROUTER_BASE_URL",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com",
            Provider::DeepSeek => "https://api.deepseek.com",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/openai",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }
}

/// 已知短名表：(短名, 提供方, 真实模型名)
const MODEL_TABLE: &[(&str, Provider, &str)] = &[
    ("gpt-5", Provider::OpenAi, "gpt-5-2025-08-07"),
    ("gpt-5-mini", Provider::OpenAi, "gpt-5-mini-2025-08-07"),
    ("gpt-5-nano", Provider::OpenAi, "gpt-5-nano-2025-08-07"),
    ("gpt-4.1", Provider::OpenAi, "gpt-4.1-2025-04-14"),
    ("gpt-4.1-mini", Provider::OpenAi, "gpt-4.1-mini-2025-04-14"),
    ("gpt-4.1-nano", Provider::OpenAi, "gpt-4.1-nano-2025-04-14"),
    ("gpt-4o", Provider::OpenAi, "gpt-4o"),
    ("o3", Provider::OpenAi, "o3-2025-04-16"),
    ("o4-mini", Provider::OpenAi, "o4-mini-2025-04-16"),
    ("claude-4.1-opus", Provider::Anthropic, "claude-opus-4-1-20250805"),
    ("claude-4-sonnet", Provider::Anthropic, "claude-sonnet-4-20250514"),
    ("claude-3.5-sonnet", Provider::Anthropic, "claude-3-5-sonnet-20241022"),
    ("deepseek-chat", Provider::DeepSeek, "deepseek-chat"),
    ("deepseek-reasoner", Provider::DeepSeek, "deepseek-reasoner"),
    ("gemini-2.5-pro", Provider::Gemini, "gemini-2.5-pro"),
    ("gemini-2.5-flash", Provider::Gemini, "gemini-2.5-flash"),
];

/// 已解析的模型配置
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// 命令行中给出的名字（用于结果目录）
    pub short_name: String,
    pub provider: Provider,
    /// 发送给 API 的模型名
    pub actual_model_name: String,
    pub api_key: String,
    pub base_url: String,
}

impl ModelConfig {
    /// 从进程环境变量解析
    pub fn resolve(name: &str) -> Result<Self, BenchError> {
        Self::resolve_with(name, |var| std::env::var(var).ok())
    }

    /// 使用自定义环境查找函数解析（便于测试）
    pub fn resolve_with(
        name: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BenchError> {
        let (provider, actual) = lookup(name).ok_or_else(|| {
            let supported: Vec<&str> = MODEL_TABLE.iter().map(|(n, _, _)| *n).collect();
            BenchError::ConfigInvalid(format!(
                "Unsupported model '{name}'. Supported models: {} (or provider/model)",
                supported.join(", ")
            ))
        })?;

        let api_key = env(provider.api_key_var())
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                BenchError::ConfigMissing(format!(
                    "Missing required environment variable: {}",
                    provider.api_key_var()
                ))
            })?;
        let base_url = env(provider.base_url_var())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| provider.default_base_url().to_string());

        Ok(Self {
            short_name: name.to_string(),
            provider,
            actual_model_name: actual,
            api_key,
            base_url,
        })
    }

    /// 按提供方创建客户端
    pub fn create_client(&self, llm: &LlmSection) -> Result<Arc<dyn LlmClient>, BenchError> {
        let timeout = Duration::from_secs(llm.request_timeout_secs);
        let client: Arc<dyn LlmClient> = match self.provider {
            Provider::Anthropic => {
                let base = if self.base_url == Provider::Anthropic.default_base_url() {
                    llm.anthropic_api_base.as_str()
                } else {
                    self.base_url.as_str()
                };
                Arc::new(
                    AnthropicClient::new(base, &self.api_key, &llm.anthropic_version, timeout)
                        .map_err(|e| BenchError::ConfigInvalid(e.to_string()))?,
                )
            }
            _ => Arc::new(
                OpenAiClient::new(&self.base_url, &self.api_key, timeout)
                    .map_err(|e| BenchError::ConfigInvalid(e.to_string()))?,
            ),
        };
        tracing::info!(
            "Using {:?} model {} ({})",
            self.provider,
            self.actual_model_name,
            self.base_url
        );
        Ok(client)
    }
}

fn lookup(name: &str) -> Option<(Provider, String)> {
    if let Some((_, provider, actual)) = MODEL_TABLE.iter().find(|(n, _, _)| *n == name) {
        return Some((*provider, (*actual).to_string()));
    }
    let (prefix, rest) = name.split_once('/')?;
    let provider = Provider::parse(prefix)?;
    if rest.is_empty() {
        return None;
    }
    Some((provider, rest.to_string()))
}
