//! 错误类型与错误分类体系
//!
//! ErrorCategory 为封闭的错误类别集合；ErrorInfo 为分类后的不可变结果（由 Classifier 生成）。
//! AgentError 为回合循环中止原因，BenchError 为编排层（配置 / 任务 / 状态 / IO）错误。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::ToolHostError;

/// 错误类别（封闭集合，序列化为 kebab-case，如 `network-timeout`）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    ConfigMissing,
    ConfigInvalid,
    AuthFailed,
    AuthExpired,
    NetworkTimeout,
    NetworkConnection,
    ToolHostError,
    ToolError,
    StateDuplicationError,
    TaskNotFound,
    VerificationFailed,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 12] = [
        ErrorCategory::ConfigMissing,
        ErrorCategory::ConfigInvalid,
        ErrorCategory::AuthFailed,
        ErrorCategory::AuthExpired,
        ErrorCategory::NetworkTimeout,
        ErrorCategory::NetworkConnection,
        ErrorCategory::ToolHostError,
        ErrorCategory::ToolError,
        ErrorCategory::StateDuplicationError,
        ErrorCategory::TaskNotFound,
        ErrorCategory::VerificationFailed,
        ErrorCategory::Unknown,
    ];

    /// 配置文件 / 持久化中使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConfigMissing => "config-missing",
            ErrorCategory::ConfigInvalid => "config-invalid",
            ErrorCategory::AuthFailed => "auth-failed",
            ErrorCategory::AuthExpired => "auth-expired",
            ErrorCategory::NetworkTimeout => "network-timeout",
            ErrorCategory::NetworkConnection => "network-connection",
            ErrorCategory::ToolHostError => "tool-host-error",
            ErrorCategory::ToolError => "tool-error",
            ErrorCategory::StateDuplicationError => "state-duplication-error",
            ErrorCategory::TaskNotFound => "task-not-found",
            ErrorCategory::VerificationFailed => "verification-failed",
            ErrorCategory::Unknown => "unknown",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase().replace('_', "-");
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// 面向用户的类别前缀（同时也是该类别的匹配模式之一，便于对已持久化消息再次分类）
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ConfigMissing => "Configuration missing",
            ErrorCategory::ConfigInvalid => "Configuration invalid",
            ErrorCategory::AuthFailed => "Authentication failed",
            ErrorCategory::AuthExpired => "Authentication expired",
            ErrorCategory::NetworkTimeout => "Network timeout",
            ErrorCategory::NetworkConnection => "Network connection error",
            ErrorCategory::ToolHostError => "Tool host error",
            ErrorCategory::ToolError => "Tool error",
            ErrorCategory::StateDuplicationError => "State duplication error",
            ErrorCategory::TaskNotFound => "Task not found",
            ErrorCategory::VerificationFailed => "Verification failed",
            ErrorCategory::Unknown => "Unexpected error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 分类结果：类别、可读消息、是否可重试、建议等待秒数、上下文（始终含 `raw` 原始错误文本）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    pub retry_after_secs: Option<u64>,
    #[serde(default)]
    pub context: BTreeMap<String, String>,
}

impl ErrorInfo {
    pub fn new(category: ErrorCategory, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            category,
            message: message.into(),
            retryable,
            retry_after_secs: None,
            context: BTreeMap::new(),
        }
    }

    pub fn with_retry_after(mut self, secs: Option<u64>) -> Self {
        self.retry_after_secs = secs;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// 原始错误文本
    pub fn raw(&self) -> &str {
        self.context.get("raw").map(String::as_str).unwrap_or("")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// 回合循环中止原因（工具级错误不会中止循环，只会作为工具结果回传给模型）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("{0}")]
    Llm(#[from] LlmError),

    #[error("Model call failed after {attempts} consecutive attempts: {last}")]
    TooManyFailures { attempts: u32, last: LlmError },

    #[error("Tool timeout: {0} timed out")]
    ToolTimeout(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("{0}")]
    ToolHost(#[from] ToolHostError),
}

/// 编排层错误：配置、任务发现、状态准备、IO / JSON
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration missing: {0}")]
    ConfigMissing(String),

    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("State duplication error: {0}")]
    StateSetup(String),

    #[error("{0}")]
    ToolHost(#[from] ToolHostError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
