//! 执行策略：通用（chat/completions 兼容）与原生扩展思考（Messages 端点）
//!
//! 两者共享同一回合循环形状：请求补全 → 有工具调用则逐个执行并回写结果 → 无工具调用即结束。
//! 每个回合结束后写入部分进度快照；达到回合上限报告失败并携带完整的部分轨迹。
//! 策略选择是模型 id 与思考强度的纯函数，可按调用覆盖。

pub mod generic;
pub mod native;
pub mod progress;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{AgentSection, TurnBackoff};
use crate::core::AgentError;
use crate::llm::{
    complete_with_timeout, CompletionRequest, CompletionResponse, LlmClient, TokenUsage,
};
use crate::tools::ToolHost;
use crate::trajectory::{normalize, Trajectory};

pub use generic::GenericStrategy;
pub use native::NativeStrategy;
pub use progress::{ProgressRecorder, ProgressSnapshot};

/// 固定系统提示词
pub const SYSTEM_PROMPT: &str = "You are a helpful agent that uses tools iteratively to complete the user's task, and when finished, provides the final answer or simply states \"Task completed\" without further tool calls.";

/// 一次执行尝试的结果
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub trajectory: Trajectory,
    pub token_usage: TokenUsage,
    pub turn_count: u32,
    pub error: Option<String>,
    pub resolved_model: String,
    pub execution_time: Duration,
}

impl ExecutionOutcome {
    /// 由最后一次快照合成失败结果（超时 / 中止）
    pub fn from_snapshot(
        snapshot: &ProgressSnapshot,
        requested_model: &str,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            success: false,
            trajectory: snapshot.trajectory(),
            token_usage: snapshot.usage,
            turn_count: snapshot.turn_count,
            error: Some(error.into()),
            resolved_model: snapshot
                .resolved_model
                .clone()
                .unwrap_or_else(|| requested_model.to_string()),
            execution_time,
        }
    }
}

/// 回合循环参数
#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub max_turns: u32,
    pub tool_timeout: Duration,
    /// 单次模型调用超时
    pub request_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub backoff: TurnBackoff,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&AgentSection::default())
    }
}

impl From<&AgentSection> for LoopSettings {
    fn from(agent: &AgentSection) -> Self {
        Self {
            max_turns: agent.max_turns,
            tool_timeout: agent.tool_timeout(),
            request_timeout: Duration::from_secs(300),
            max_consecutive_failures: agent.max_consecutive_failures.max(1),
            backoff: agent.turn_backoff,
        }
    }
}

/// 执行策略
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    async fn run(
        &self,
        instruction: &str,
        host: &dyn ToolHost,
        progress: &ProgressRecorder,
    ) -> Result<ExecutionOutcome, AgentError>;
}

/// 封闭的策略选择结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Native { thinking_budget: u32 },
    Generic { reasoning_effort: Option<String> },
}

impl StrategyKind {
    pub fn build(
        &self,
        client: Arc<dyn LlmClient>,
        model: &str,
        settings: LoopSettings,
    ) -> Box<dyn ExecutionStrategy> {
        match self {
            StrategyKind::Native { thinking_budget } => {
                Box::new(NativeStrategy::new(client, model, *thinking_budget, settings))
            }
            StrategyKind::Generic { reasoning_effort } => Box::new(GenericStrategy::new(
                client,
                model,
                reasoning_effort.clone(),
                settings,
            )),
        }
    }
}

fn is_default_effort(effort: &str) -> bool {
    let e = effort.trim();
    e.is_empty() || e.eq_ignore_ascii_case("default")
}

/// 思考强度 → 思考预算（token）
pub fn thinking_budget_for(effort: &str) -> u32 {
    match effort.trim().to_lowercase().as_str() {
        "low" => 1024,
        "medium" => 2048,
        "high" => 4096,
        _ => 2048,
    }
}

/// 按模型 id 与思考强度选择策略
pub fn select_strategy(model: &str, effort: &str) -> StrategyKind {
    if model.to_lowercase().contains("claude") && !is_default_effort(effort) {
        StrategyKind::Native {
            thinking_budget: thinking_budget_for(effort),
        }
    } else {
        StrategyKind::Generic {
            reasoning_effort: (!is_default_effort(effort)).then(|| effort.trim().to_string()),
        }
    }
}

/// 取提供方回报模型名的最后一段（`openai/gpt-4o` → `gpt-4o`）
fn short_model_name(reported: &str) -> &str {
    reported.rsplit('/').next().unwrap_or(reported)
}

/// 回合循环的可变状态：提供方消息、累计用量、回合数、回报模型名
pub(crate) struct LoopState {
    pub messages: Vec<Value>,
    pub usage: TokenUsage,
    pub turns: u32,
    resolved_model: Option<String>,
    started: Instant,
}

impl LoopState {
    pub fn new(instruction: &str) -> Self {
        Self {
            messages: vec![json!({ "role": "user", "content": instruction })],
            usage: TokenUsage::default(),
            turns: 0,
            resolved_model: None,
            started: Instant::now(),
        }
    }

    /// 以首个回复中的模型名为准
    pub fn observe_model(&mut self, reported: Option<&str>) {
        if self.resolved_model.is_none() {
            if let Some(name) = reported.filter(|n| !n.trim().is_empty()) {
                self.resolved_model = Some(short_model_name(name).to_string());
            }
        }
    }

    pub fn snapshot(&self, progress: &ProgressRecorder) {
        progress.record(
            &self.messages,
            self.usage,
            self.turns,
            self.resolved_model.as_deref(),
        );
    }

    pub fn finish(&self, requested_model: &str, error: Option<String>) -> ExecutionOutcome {
        ExecutionOutcome {
            success: error.is_none(),
            trajectory: normalize(&self.messages),
            token_usage: self.usage,
            turn_count: self.turns,
            error,
            resolved_model: self
                .resolved_model
                .clone()
                .unwrap_or_else(|| requested_model.to_string()),
            execution_time: self.started.elapsed(),
        }
    }
}

/// 一次模型调用。瞬时失败按类别退避后返回 Ok(None)，调用方重做本回合；
/// 连续失败达到上限返回 TooManyFailures，不可重试的失败立即返回。
pub(crate) async fn request_completion(
    client: &dyn LlmClient,
    request: CompletionRequest<'_>,
    settings: &LoopSettings,
    failures: &mut u32,
) -> Result<Option<CompletionResponse>, AgentError> {
    let model = request.model.to_string();
    match complete_with_timeout(client, request, settings.request_timeout).await {
        Ok(response) => {
            *failures = 0;
            Ok(Some(response))
        }
        Err(e) if e.is_transient() => {
            *failures += 1;
            if *failures >= settings.max_consecutive_failures {
                tracing::error!(model = %model, attempts = *failures, error = %e, "Model call failed repeatedly, aborting");
                return Err(AgentError::TooManyFailures {
                    attempts: *failures,
                    last: e,
                });
            }
            let wait = settings.backoff.delay(e.kind(), *failures);
            tracing::warn!(
                model = %model,
                attempt = *failures,
                wait_secs = wait.as_secs(),
                error = %e,
                "Model call failed, backing off"
            );
            tokio::time::sleep(wait).await;
            Ok(None)
        }
        Err(e) => {
            tracing::error!(model = %model, error = %e, "Model call failed permanently");
            Err(AgentError::Llm(e))
        }
    }
}

/// 解析工具参数：字符串按 JSON 解析，空串视为空对象
pub(crate) fn parse_tool_arguments(raw: Option<&Value>) -> Result<Value, String> {
    match raw {
        None | Some(Value::Null) => Ok(json!({})),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(json!({})),
        Some(Value::String(s)) => {
            serde_json::from_str(s).map_err(|e| format!("Invalid tool arguments: {e}"))
        }
        Some(other) => Ok(other.clone()),
    }
}
