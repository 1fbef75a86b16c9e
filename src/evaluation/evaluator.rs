//! 评测编排：每个任务依次 Setup → Execute → Verify → Cleanup
//!
//! - 续跑：已保存的成功结果或不可重试的失败直接复用；可重试的失败删除任务目录后重跑
//! - 并发：TaskScheduler 有界并发；状态管理器要求串行时宽度为 1
//! - 取消：取消令牌中止 Execute / Verify，Cleanup 仍然执行，被取消的任务不落盘

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::core::{standardize, BenchError, Classifier, ErrorCategory, ErrorInfo, TaskScheduler};
use crate::evaluation::{EvaluationReport, ResultStore, TaskResult};
use crate::task::{StateManager, Task, TaskManager};
use crate::tools::{ServiceConfig, ToolHostLauncher};

/// 验证脚本可读取的轨迹文件路径
pub const MESSAGES_ENV: &str = "TASKBENCH_MESSAGES";

pub struct Evaluator {
    agent: Agent,
    task_manager: Arc<dyn TaskManager>,
    state_manager: Arc<dyn StateManager>,
    launcher: Arc<dyn ToolHostLauncher>,
    store: ResultStore,
    service_config: ServiceConfig,
    concurrency: usize,
    cancel: CancellationToken,
    classifier: Classifier,
}

impl Evaluator {
    pub fn new(
        agent: Agent,
        task_manager: Arc<dyn TaskManager>,
        state_manager: Arc<dyn StateManager>,
        launcher: Arc<dyn ToolHostLauncher>,
        store: ResultStore,
    ) -> Self {
        Self {
            agent,
            task_manager,
            state_manager,
            launcher,
            store,
            service_config: ServiceConfig::new(),
            concurrency: 3,
            cancel: CancellationToken::new(),
            classifier: Classifier::default(),
        }
    }

    /// [services.<name>] 中的静态配置，Setup 产生的键会覆盖它
    pub fn with_service_config(mut self, cfg: ServiceConfig) -> Self {
        self.service_config = cfg;
        self
    }

    pub fn with_concurrency(mut self, width: usize) -> Self {
        self.concurrency = width.max(1);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// 评测匹配 filter 的全部任务，写出 summary.json
    pub async fn run(&self, filter: &str) -> Result<EvaluationReport, BenchError> {
        let start_time = Utc::now();
        let service = self.task_manager.service().to_string();
        let tasks = self.task_manager.filter(filter)?;
        let task_names: HashSet<String> = tasks.iter().map(Task::name).collect();

        let mut pending = Vec::new();
        for task in tasks {
            match self.store.load(&task) {
                Some(previous) if !previous.is_retryable(&self.classifier) => {
                    tracing::info!(
                        task = %task.name(),
                        status = previous.status(),
                        "Reusing stored result"
                    );
                }
                Some(previous) => {
                    tracing::info!(
                        task = %task.name(),
                        error = previous.error_message.as_deref().unwrap_or_default(),
                        "Stored result failed with a retryable error, re-running"
                    );
                    self.store.discard(&task)?;
                    pending.push(task);
                }
                None => pending.push(task),
            }
        }

        let scheduler = if self.state_manager.requires_sequential() {
            TaskScheduler::sequential()
        } else {
            TaskScheduler::new(self.concurrency)
        };
        tracing::info!(
            service = %service,
            model = %self.store.model(),
            pending = pending.len(),
            width = scheduler.width(),
            "Evaluation started"
        );

        let fresh: Vec<TaskResult> = scheduler
            .run_all(pending, &self.cancel, |task| self.run_task(task))
            .await
            .into_iter()
            .flatten()
            .collect();

        let mut merged: HashMap<String, TaskResult> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|r| r.matches_filter(filter) || task_names.contains(&r.task_name))
            .map(|r| (r.task_name.clone(), r))
            .collect();
        for result in fresh {
            merged.insert(result.task_name.clone(), result);
        }

        let report = EvaluationReport::new(
            self.store.model(),
            &service,
            filter,
            start_time,
            Utc::now(),
            merged.into_values().collect(),
        );
        let path = self.store.save_summary(&report)?;
        tracing::info!(
            total = report.total_tasks,
            passed = report.successful_tasks,
            failed = report.failed_tasks,
            summary = %path.display(),
            "Evaluation finished"
        );
        Ok(report)
    }

    /// 单个任务；被取消时返回 None
    pub async fn run_task(&self, mut task: Task) -> Option<TaskResult> {
        let start_time = Utc::now();
        let started = Instant::now();
        tracing::info!(task = %task.name(), "Task started");

        let result = match self.state_manager.set_up(&mut task).await {
            Err(e) => {
                let message = match &e {
                    BenchError::StateSetup(_) => e.to_string(),
                    other => format!("State duplication error: {other}"),
                };
                let category = ErrorCategory::StateDuplicationError;
                let info = ErrorInfo::new(category, message, self.classifier.policy(category).retryable);
                tracing::error!(task = %task.name(), error = %info.message, "Setup failed");
                Some(TaskResult::failed(&task, &info))
            }
            Ok(()) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    result = self.execute_and_verify(&task) => Some(result),
                }
            }
        };

        if let Err(e) = self.state_manager.clean_up(&mut task).await {
            tracing::warn!(task = %task.name(), error = %e, "Cleanup failed");
        }

        let Some(result) = result else {
            tracing::warn!(task = %task.name(), "Task cancelled, result not saved");
            if let Err(e) = self.store.discard(&task) {
                tracing::warn!(task = %task.name(), error = %e, "Failed to remove partial output");
            }
            return None;
        };

        let result = result.with_execution_time(started.elapsed().as_secs_f64());
        if let Err(e) = self.store.save_meta(&task, &result, start_time, Utc::now()) {
            tracing::warn!(task = %task.name(), error = %e, "Failed to save task meta");
        }
        tracing::info!(
            task = %task.name(),
            status = result.status(),
            turns = result.turn_count,
            secs = result.execution_time,
            error = result.error_message.as_deref().unwrap_or_default(),
            "Task finished"
        );
        Some(result)
    }

    async fn execute_and_verify(&self, task: &Task) -> TaskResult {
        let service = self.task_manager.service();
        let instruction = match self.task_manager.instruction_text(task) {
            Ok(text) => text,
            Err(e) => return TaskResult::failed(task, &self.classifier.classify(&e.to_string())),
        };

        let mut service_config = self.service_config.clone();
        let mut verification_env = HashMap::new();
        if let Some(resources) = &task.resources {
            service_config.extend(resources.service_config.clone());
            verification_env.extend(resources.verification_env.clone());
        }

        let host = match self.launcher.launch(service, &service_config).await {
            Ok(host) => host,
            Err(e) => {
                let info = self.launch_error(&e);
                tracing::error!(task = %task.name(), error = %e, "Tool host launch failed");
                return TaskResult::failed(task, &standardize(&info, service));
            }
        };

        let outcome = self.agent.execute(&instruction, host.as_ref()).await;
        if let Err(e) = host.close().await {
            tracing::warn!(task = %task.name(), error = %e, "Failed to close tool host");
        }

        match self.store.save_messages(task, &outcome.trajectory) {
            Ok(path) => {
                verification_env.insert(MESSAGES_ENV.to_string(), path.display().to_string());
            }
            Err(e) => tracing::warn!(task = %task.name(), error = %e, "Failed to save messages"),
        }

        if !outcome.success {
            let raw = outcome
                .error
                .clone()
                .unwrap_or_else(|| "Agent execution failed".to_string());
            let info = standardize(&self.classifier.classify(&raw), service);
            return TaskResult::failed(task, &info).with_outcome(&outcome);
        }

        let verification_failed = ErrorInfo::new(
            ErrorCategory::VerificationFailed,
            "Verification failed",
            self.classifier.policy(ErrorCategory::VerificationFailed).retryable,
        );
        match self.task_manager.run_verification(task, &verification_env).await {
            Ok(output) if output.passed() => TaskResult::passed(task).with_outcome(&outcome),
            Ok(output) => {
                let detail = if output.timed_out {
                    "Verification timed out".to_string()
                } else if output.stderr.trim().is_empty() {
                    output.stdout
                } else {
                    output.stderr
                };
                TaskResult::failed(task, &verification_failed)
                    .with_outcome(&outcome)
                    .with_detail(detail)
            }
            Err(e) => TaskResult::failed(task, &verification_failed)
                .with_outcome(&outcome)
                .with_detail(e.to_string()),
        }
    }

    /// 配置类错误保留原类别，其余归为工具宿主错误
    fn launch_error(&self, err: &BenchError) -> ErrorInfo {
        match err {
            BenchError::ConfigMissing(_) | BenchError::ConfigInvalid(_) => {
                self.classifier.classify(&err.to_string())
            }
            other => {
                let category = ErrorCategory::ToolHostError;
                let policy = self.classifier.policy(category);
                ErrorInfo::new(category, format!("Tool host error: {other}"), policy.retryable)
                    .with_context("raw", other.to_string())
            }
        }
    }
}
