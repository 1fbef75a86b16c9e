//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKBENCH__*` 覆盖（双下划线表示嵌套，如 `TASKBENCH__AGENT__TIMEOUT_SECS=900`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::FailureKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub evaluation: EvaluationSection,
    /// [retry.<category>] 段：按错误类别覆盖重试策略
    pub retry: HashMap<String, RetryOverride>,
    /// [services.<name>] 段：服务相关键值（API Key、模板目录、浏览器参数等）
    pub services: HashMap<String, HashMap<String, String>>,
    /// [pricing.<model>] 段：补充或覆盖内置价格表（每百万 token 美元）
    pub pricing: HashMap<String, PriceOverride>,
}

/// [app] 段：结果目录、实验名、任务根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub output_dir: PathBuf,
    pub exp_name: String,
    pub tasks_root: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./results"),
            exp_name: "test-run".to_string(),
            tasks_root: PathBuf::from("./tasks"),
        }
    }
}

/// [agent] 段：回合上限、超时、连续失败上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单次执行整体超时（秒）
    pub timeout_secs: u64,
    pub max_turns: u32,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 模型调用连续瞬时失败上限
    pub max_consecutive_failures: u32,
    /// default / low / medium / high
    pub reasoning_effort: String,
    pub turn_backoff: TurnBackoff,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            max_turns: 100,
            tool_timeout_secs: 60,
            max_consecutive_failures: 3,
            reasoning_effort: "default".to_string(),
            turn_backoff: TurnBackoff::default(),
        }
    }
}

impl AgentSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// [agent.turn_backoff] 段：回合内模型调用失败的指数退避底数（第 n 次连续失败等待 base^n 秒）
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TurnBackoff {
    pub timeout: u64,
    pub rate_limit: u64,
    pub other: u64,
}

impl Default for TurnBackoff {
    fn default() -> Self {
        Self {
            timeout: 8,
            rate_limit: 12,
            other: 2,
        }
    }
}

impl TurnBackoff {
    /// 第 failures 次连续失败后的等待时间
    pub fn delay(&self, kind: FailureKind, failures: u32) -> Duration {
        let base = match kind {
            FailureKind::Timeout => self.timeout,
            FailureKind::RateLimit => self.rate_limit,
            FailureKind::Transient | FailureKind::Permanent => self.other,
        };
        Duration::from_secs(base.saturating_pow(failures))
    }
}

/// [llm] 段：HTTP 超时与 Anthropic 端点
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub request_timeout_secs: u64,
    pub anthropic_api_base: String,
    pub anthropic_version: String,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 300,
            anthropic_api_base: "https://api.anthropic.com".to_string(),
            anthropic_version: "2023-06-01".to_string(),
        }
    }
}

/// [evaluation] 段：并发宽度、验证脚本超时与解释器
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    pub concurrency: usize,
    pub verify_timeout_secs: u64,
    pub verify_interpreter: String,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            concurrency: 3,
            verify_timeout_secs: 90,
            verify_interpreter: "python3".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq, Eq)]
pub struct RetryOverride {
    pub retryable: Option<bool>,
    pub max_retries: Option<u32>,
    pub backoff_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct PriceOverride {
    pub input: f64,
    pub output: f64,
}

impl AppConfig {
    /// 某服务的配置键值（未配置时为空）
    pub fn service(&self, name: &str) -> HashMap<String, String> {
        self.services.get(name).cloned().unwrap_or_default()
    }
}

/// 从 config 目录加载配置，环境变量 TASKBENCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKBENCH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKBENCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.timeout_secs, 600);
        assert_eq!(cfg.agent.max_turns, 100);
        assert_eq!(cfg.agent.tool_timeout_secs, 60);
        assert_eq!(cfg.agent.max_consecutive_failures, 3);
        assert_eq!(cfg.agent.turn_backoff, TurnBackoff { timeout: 8, rate_limit: 12, other: 2 });
        assert_eq!(cfg.evaluation.concurrency, 3);
        assert_eq!(cfg.evaluation.verify_timeout_secs, 90);
        assert_eq!(cfg.app.exp_name, "test-run");
    }

    #[test]
    fn test_turn_backoff_per_kind() {
        let b = TurnBackoff::default();
        assert_eq!(b.delay(FailureKind::Timeout, 1), Duration::from_secs(8));
        assert_eq!(b.delay(FailureKind::RateLimit, 2), Duration::from_secs(144));
        assert_eq!(b.delay(FailureKind::Transient, 3), Duration::from_secs(8));
    }

    #[test]
    fn test_load_from_file_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
[agent]
timeout_secs = 30

[agent.turn_backoff]
rate_limit = 20

[retry.network-timeout]
max_retries = 1

[services.filesystem]
template_dir = "/tmp/template"

[pricing."my-model"]
input = 1.0
output = 2.0
"#
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.timeout_secs, 30);
        assert_eq!(cfg.agent.max_turns, 100);
        assert_eq!(cfg.agent.turn_backoff.rate_limit, 20);
        assert_eq!(cfg.agent.turn_backoff.timeout, 8);
        assert_eq!(cfg.retry["network-timeout"].max_retries, Some(1));
        assert_eq!(cfg.service("filesystem")["template_dir"], "/tmp/template");
        assert!(cfg.service("notion").is_empty());
        assert_eq!(cfg.pricing["my-model"].output, 2.0);
    }
}
