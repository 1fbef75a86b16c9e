//! 错误分类器
//!
//! 对字符串化的错误做有序模式匹配，首个命中的类别生效；未命中归为 unknown（永不重试）。
//! 每个类别带静态重试策略 {retryable, max_retries, backoff_secs}，第 n 次重试等待 `backoff_secs × n` 秒。

use std::collections::HashMap;
use std::time::Duration;

use crate::config::RetryOverride;
use crate::core::{ErrorCategory, ErrorInfo};

/// 单个类别的重试策略
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable: bool,
    pub max_retries: u32,
    pub backoff_secs: u64,
}

impl RetryPolicy {
    pub const fn retry(max_retries: u32, backoff_secs: u64) -> Self {
        Self {
            retryable: true,
            max_retries,
            backoff_secs,
        }
    }

    pub const fn terminal() -> Self {
        Self {
            retryable: false,
            max_retries: 0,
            backoff_secs: 0,
        }
    }

    /// 第 attempt 次重试前的等待时间（线性退避，attempt 从 1 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.backoff_secs.saturating_mul(u64::from(attempt)))
    }
}

/// 有序匹配表：越靠前优先级越高。过期类放在鉴权失败之前（"401 ... token expired" 归为过期），
/// 工具宿主放在网络类之前（"mcp network error" 归为工具宿主）。
const RULES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::ConfigMissing,
        &[
            "configuration missing",
            "missing required environment variable",
            "missing required",
            "is required",
            "not configured",
        ],
    ),
    (
        ErrorCategory::ConfigInvalid,
        &[
            "configuration invalid",
            "invalid configuration",
            "config error",
            "unsupported model",
            "unsupported service",
        ],
    ),
    (
        ErrorCategory::AuthExpired,
        &[
            "authentication expired",
            "token expired",
            "expired token",
            "session expired",
            "credentials have expired",
        ],
    ),
    (
        ErrorCategory::AuthFailed,
        &[
            "authentication failed",
            "unauthorized",
            "invalid api key",
            "invalid x-api-key",
            "forbidden",
            "permission denied",
        ],
    ),
    (
        ErrorCategory::ToolHostError,
        &[
            "tool host error",
            "mcp network error",
            "mcp server",
            "mcp service error",
            "failed to start tool host",
        ],
    ),
    (
        ErrorCategory::NetworkTimeout,
        &["network timeout", "timed out", "timeout", "etimedout", "deadline exceeded"],
    ),
    (
        ErrorCategory::NetworkConnection,
        &[
            "network connection error",
            "connection refused",
            "econnrefused",
            "connection reset",
            "network error",
            "error sending request",
            "dns error",
            "rate limit",
            "too many requests",
            "server error",
            "service unavailable",
            "bad gateway",
        ],
    ),
    (
        ErrorCategory::ToolError,
        &["tool error", "tool execution failed", "unknown tool"],
    ),
    (
        ErrorCategory::StateDuplicationError,
        &["state duplication", "already exists", "duplication failed"],
    ),
    (
        ErrorCategory::TaskNotFound,
        &["task not found", "no tasks matched", "no such task"],
    ),
    (ErrorCategory::VerificationFailed, &["verification failed"]),
];

fn default_policy(category: ErrorCategory) -> RetryPolicy {
    match category {
        ErrorCategory::NetworkTimeout => RetryPolicy::retry(3, 5),
        ErrorCategory::NetworkConnection => RetryPolicy::retry(3, 10),
        ErrorCategory::ToolHostError => RetryPolicy::retry(3, 5),
        ErrorCategory::StateDuplicationError => RetryPolicy::retry(3, 5),
        _ => RetryPolicy::terminal(),
    }
}

/// 错误分类器：确定性、无副作用；策略可按类别覆盖（unknown 除外）
#[derive(Clone, Debug)]
pub struct Classifier {
    policies: HashMap<ErrorCategory, RetryPolicy>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self {
            policies: ErrorCategory::ALL
                .into_iter()
                .map(|c| (c, default_policy(c)))
                .collect(),
        }
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 覆盖某类别的策略；unknown 始终不可重试
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        if category != ErrorCategory::Unknown {
            self.policies.insert(category, policy);
        }
        self
    }

    /// 从 `[retry.<category>]` 配置段构建；无法识别的类别名会被忽略并告警
    pub fn from_overrides(overrides: &HashMap<String, RetryOverride>) -> Self {
        let mut classifier = Self::default();
        for (name, o) in overrides {
            let Some(category) = ErrorCategory::parse(name) else {
                tracing::warn!(category = %name, "Ignoring retry override for unknown category");
                continue;
            };
            let base = classifier.policy(category);
            classifier = classifier.with_policy(
                category,
                RetryPolicy {
                    retryable: o.retryable.unwrap_or(base.retryable),
                    max_retries: o.max_retries.unwrap_or(base.max_retries),
                    backoff_secs: o.backoff_secs.unwrap_or(base.backoff_secs),
                },
            );
        }
        classifier
    }

    pub fn policy(&self, category: ErrorCategory) -> RetryPolicy {
        self.policies
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_policy(category))
    }

    /// 仅做类别匹配
    pub fn category_of(&self, error: &str) -> ErrorCategory {
        let lower = error.to_lowercase();
        RULES
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    /// 分类：类别限定的可读消息 + 原始文本存入 context["raw"]
    pub fn classify(&self, error: &str) -> ErrorInfo {
        let raw = error.trim();
        let category = self.category_of(raw);
        let policy = self.policy(category);
        let message = qualified_message(category, raw);
        ErrorInfo::new(category, message, policy.retryable)
            .with_retry_after(policy.retryable.then_some(policy.backoff_secs))
            .with_context("raw", raw)
    }
}

/// 使用默认策略分类
pub fn classify(error: &str) -> ErrorInfo {
    Classifier::default().classify(error)
}

fn qualified_message(category: ErrorCategory, raw: &str) -> String {
    let label = category.label();
    let first_line = raw.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        return label.to_string();
    }
    // 原文已带类别前缀时不重复添加
    if first_line.to_lowercase().starts_with(&label.to_lowercase()) {
        return first_line.to_string();
    }
    format!("{label}: {first_line}")
}

/// 将网络 / 工具宿主类错误改写为带服务名的消息（如 "Filesystem MCP network error"）；类别保持不变
pub fn standardize(info: &ErrorInfo, service: &str) -> ErrorInfo {
    let base = match info.category {
        ErrorCategory::NetworkTimeout => "operation timed out",
        ErrorCategory::NetworkConnection => "network error",
        ErrorCategory::ToolHostError => "MCP network error",
        _ => return info.clone(),
    };
    let mut out = info.clone();
    out.message = format!("{} {}", service_title(service), base);
    out.context
        .entry("detail".to_string())
        .or_insert_with(|| info.message.clone());
    out
}

fn service_title(service: &str) -> String {
    service
        .split(['_', '-'])
        .filter(|s| !s.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_network_timeout() {
        let info = classify("Request timed out: deadline elapsed");
        assert_eq!(info.category, ErrorCategory::NetworkTimeout);
        assert!(info.retryable);
        assert_eq!(info.retry_after_secs, Some(5));
        assert_eq!(info.raw(), "Request timed out: deadline elapsed");
        assert!(info.message.starts_with("Network timeout:"));
    }

    #[test]
    fn test_classify_order_tool_host_before_network() {
        let info = classify("Filesystem MCP Network Error");
        assert_eq!(info.category, ErrorCategory::ToolHostError);
        assert!(info.retryable);
    }

    #[test]
    fn test_classify_expired_before_auth_failed() {
        let info = classify("401 Unauthorized: token expired");
        assert_eq!(info.category, ErrorCategory::AuthExpired);
        assert!(!info.retryable);
    }

    #[test]
    fn test_classify_config_missing() {
        let info = classify("Missing required environment variable: OPENAI_API_KEY");
        assert_eq!(info.category, ErrorCategory::ConfigMissing);
        assert!(!info.retryable);
        assert_eq!(info.retry_after_secs, None);
    }

    #[test]
    fn test_classify_state_duplication() {
        let info = classify("page already exists");
        assert_eq!(info.category, ErrorCategory::StateDuplicationError);
        assert!(info.retryable);
    }

    #[test]
    fn test_classify_unknown_never_retryable() {
        let info = classify("something odd happened");
        assert_eq!(info.category, ErrorCategory::Unknown);
        assert!(!info.retryable);
        assert_eq!(info.message, "Unexpected error: something odd happened");

        let classifier = Classifier::default()
            .with_policy(ErrorCategory::Unknown, RetryPolicy::retry(5, 1));
        assert!(!classifier.classify("something odd happened").retryable);
    }

    #[test]
    fn test_classify_is_deterministic() {
        let a = classify("connection refused by peer");
        let b = classify("connection refused by peer");
        assert_eq!(a, b);
        assert_eq!(a.category, ErrorCategory::NetworkConnection);
    }

    #[test]
    fn test_reclassify_qualified_message_is_stable() {
        for raw in [
            "Request timed out",
            "MCP server 'fs' terminated unexpectedly",
            "Tool execution failed: boom",
            "Verification failed",
            "page already exists",
        ] {
            let first = classify(raw);
            let second = classify(&first.message);
            assert_eq!(first.category, second.category, "{raw}");
        }
    }

    #[test]
    fn test_retry_policy_linear_delay() {
        let policy = RetryPolicy::retry(3, 5);
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(15));
    }

    #[test]
    fn test_overrides_from_config() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "network-timeout".to_string(),
            RetryOverride {
                retryable: None,
                max_retries: Some(1),
                backoff_secs: Some(30),
            },
        );
        overrides.insert("bogus".to_string(), RetryOverride::default());
        let classifier = Classifier::from_overrides(&overrides);
        let policy = classifier.policy(ErrorCategory::NetworkTimeout);
        assert!(policy.retryable);
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff_secs, 30);
    }

    #[test]
    fn test_standardize_service_prefix() {
        let info = classify("MCP server 'filesystem' transport error: broken pipe");
        let std = standardize(&info, "filesystem");
        assert_eq!(std.message, "Filesystem MCP network error");
        assert_eq!(std.category, ErrorCategory::ToolHostError);
        assert!(std.context.contains_key("detail"));

        let other = classify("Tool execution failed: nope");
        assert_eq!(standardize(&other, "notion"), other);

        let timeout = classify("timed out");
        assert_eq!(
            standardize(&timeout, "playwright_webarena").message,
            "Playwright Webarena operation timed out"
        );
    }
}
