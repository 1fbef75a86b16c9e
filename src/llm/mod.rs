//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Anthropic / Mock）与模型配置

pub mod anthropic;
pub mod mock;
pub mod model_config;
pub mod openai;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use mock::MockLlmClient;
pub use model_config::{ModelConfig, Provider};
pub use openai::OpenAiClient;
pub use traits::{
    complete_with_timeout, CompletionRequest, CompletionResponse, FailureKind, LlmClient,
    LlmError, TokenUsage,
};
