//! Agent：回合循环驱动
//!
//! execute 按模型与思考强度选择策略，并对每次尝试施加外层超时：
//! - 超时：success=false，轨迹由最后一次部分进度快照重建
//! - 策略返回错误：分类；可重试且仍有次数时按类别策略等待后从头开始新的对话，否则返回类别限定的错误消息
//! - 放弃的尝试已消耗的 token 计入最终结果；回合数只计入用量统计（结果中的回合数与轨迹一致）
//! 用量统计由 Agent 实例持有，跨调用累计，可单独重置。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::core::{Classifier, UsageStats, UsageTracker};
use crate::llm::{LlmClient, TokenUsage};
use crate::strategy::{
    select_strategy, ExecutionOutcome, LoopSettings, ProgressRecorder, StrategyKind,
};
use crate::tools::ToolHost;

pub struct Agent {
    client: Arc<dyn LlmClient>,
    model: String,
    reasoning_effort: String,
    settings: LoopSettings,
    timeout: Duration,
    classifier: Classifier,
    usage: UsageTracker,
}

impl Agent {
    /// 使用默认参数（600 秒外层超时、100 回合上限）
    pub fn new(client: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            reasoning_effort: "default".to_string(),
            settings: LoopSettings::default(),
            timeout: Duration::from_secs(600),
            classifier: Classifier::default(),
            usage: UsageTracker::new(),
        }
    }

    /// 按 [agent] / [llm] / [retry.*] 配置构建
    pub fn from_config(client: Arc<dyn LlmClient>, model: impl Into<String>, cfg: &AppConfig) -> Self {
        let mut settings = LoopSettings::from(&cfg.agent);
        settings.request_timeout = Duration::from_secs(cfg.llm.request_timeout_secs);
        Self::new(client, model)
            .with_reasoning_effort(cfg.agent.reasoning_effort.clone())
            .with_timeout(cfg.agent.timeout())
            .with_settings(settings)
            .with_classifier(Classifier::from_overrides(&cfg.retry))
    }

    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = effort.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// 默认选择的策略
    pub fn strategy_kind(&self) -> StrategyKind {
        select_strategy(&self.model, &self.reasoning_effort)
    }

    pub async fn execute(&self, instruction: &str, host: &dyn ToolHost) -> ExecutionOutcome {
        self.execute_with_strategy(instruction, host, self.strategy_kind())
            .await
    }

    /// 以指定策略执行（覆盖默认选择）
    pub async fn execute_with_strategy(
        &self,
        instruction: &str,
        host: &dyn ToolHost,
        kind: StrategyKind,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        let strategy = kind.build(self.client.clone(), &self.model, self.settings.clone());
        tracing::info!(model = %self.model, strategy = ?kind, "Agent execution started");

        let mut attempt = 0u32;
        let mut carried = TokenUsage::default();
        let mut carried_turns = 0u32;
        let mut outcome = loop {
            attempt += 1;
            let progress = ProgressRecorder::new();
            match tokio::time::timeout(self.timeout, strategy.run(instruction, host, &progress)).await {
                Ok(Ok(outcome)) => break outcome,
                Ok(Err(err)) => {
                    let info = self.classifier.classify(&err.to_string());
                    let policy = self.classifier.policy(info.category);
                    if info.retryable && attempt <= policy.max_retries {
                        let abandoned = progress.snapshot();
                        carried.add(&abandoned.usage);
                        carried_turns += abandoned.turn_count;
                        let wait = policy.delay(attempt);
                        tracing::warn!(
                            model = %self.model,
                            attempt,
                            category = info.category.as_str(),
                            wait_secs = wait.as_secs(),
                            error = %info.message,
                            "Execution failed, retrying with a fresh conversation"
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    tracing::error!(model = %self.model, attempt, error = %info.message, "Execution failed");
                    break ExecutionOutcome::from_snapshot(
                        &progress.snapshot(),
                        &self.model,
                        info.message,
                        start.elapsed(),
                    );
                }
                Err(_) => {
                    let snapshot = progress.snapshot();
                    tracing::warn!(
                        model = %self.model,
                        timeout_secs = self.timeout.as_secs(),
                        turns = snapshot.turn_count,
                        "Execution timed out"
                    );
                    break ExecutionOutcome::from_snapshot(
                        &snapshot,
                        &self.model,
                        format!("Execution timed out after {} seconds", self.timeout.as_secs()),
                        start.elapsed(),
                    );
                }
            }
        };

        outcome.token_usage.add(&carried);
        self.usage.update(
            outcome.success,
            &outcome.token_usage,
            outcome.turn_count + carried_turns,
            outcome.execution_time.as_secs_f64(),
        );
        outcome
    }

    /// 供非异步调用方使用：在当前线程新建运行时执行（不可在已有运行时内调用）
    pub fn execute_sync(&self, instruction: &str, host: &dyn ToolHost) -> ExecutionOutcome {
        match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt.block_on(self.execute(instruction, host)),
            Err(e) => {
                let message = format!("Failed to start runtime: {e}");
                tracing::error!(error = %message, "execute_sync");
                ExecutionOutcome::from_snapshot(&Default::default(), &self.model, message, Duration::ZERO)
            }
        }
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.usage.stats()
    }

    pub fn reset_usage_stats(&self) {
        self.usage.reset();
    }
}
