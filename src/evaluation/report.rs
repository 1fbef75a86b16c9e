//! 任务结果与评测报告

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Classifier, ErrorCategory, ErrorInfo};
use crate::llm::TokenUsage;
use crate::strategy::ExecutionOutcome;
use crate::task::Task;
use crate::trajectory::Trajectory;

/// 单个任务的评测结果（可续跑的最小单位）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_name: String,
    pub category: String,
    pub task_id: String,
    pub success: bool,
    /// 秒
    pub execution_time: f64,
    pub error_message: Option<String>,
    pub error_category: Option<ErrorCategory>,
    /// 验证脚本 stderr 等补充信息
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_model: Option<String>,
    /// 轨迹单独保存在 messages.json
    #[serde(skip)]
    pub model_output: Trajectory,
}

impl TaskResult {
    fn base(task: &Task, success: bool) -> Self {
        Self {
            task_name: task.name(),
            category: task.category.clone(),
            task_id: task.task_id.clone(),
            success,
            execution_time: 0.0,
            error_message: None,
            error_category: None,
            error_detail: None,
            token_usage: TokenUsage::default(),
            turn_count: 0,
            resolved_model: None,
            model_output: Trajectory::new(),
        }
    }

    pub fn passed(task: &Task) -> Self {
        Self::base(task, true)
    }

    pub fn failed(task: &Task, info: &ErrorInfo) -> Self {
        let mut result = Self::base(task, false);
        result.error_message = Some(info.message.clone());
        result.error_category = Some(info.category);
        result.error_detail = info.context.get("detail").cloned();
        result
    }

    /// 带入 Agent 执行的用量、回合数与轨迹
    pub fn with_outcome(mut self, outcome: &ExecutionOutcome) -> Self {
        self.token_usage = outcome.token_usage;
        self.turn_count = outcome.turn_count;
        self.resolved_model = Some(outcome.resolved_model.clone());
        self.model_output = outcome.trajectory.clone();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.trim().is_empty() {
            self.error_detail = Some(detail);
        }
        self
    }

    pub fn with_execution_time(mut self, secs: f64) -> Self {
        self.execution_time = secs;
        self
    }

    pub fn status(&self) -> &'static str {
        if self.success {
            "PASS"
        } else {
            "FAIL"
        }
    }

    /// 失败且属于可重试类别时，续跑会丢弃旧产物重新执行
    pub fn is_retryable(&self, classifier: &Classifier) -> bool {
        if self.success {
            return false;
        }
        let category = match self.error_category {
            Some(category) => category,
            None => classifier.category_of(self.error_message.as_deref().unwrap_or_default()),
        };
        classifier.policy(category).retryable
    }

    /// 是否匹配任务过滤表达式（用于合并历史结果）
    pub fn matches_filter(&self, filter: &str) -> bool {
        let filter = filter.trim();
        if filter.is_empty() || filter.eq_ignore_ascii_case("all") {
            return true;
        }
        if filter.contains('/') {
            return self.task_name == filter;
        }
        self.category == filter
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// 百分比
    pub success_rate: f64,
    pub avg_execution_time: f64,
}

/// 一个 (模型, 服务, 运行) 的汇总报告，保存为 summary.json
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub model: String,
    pub service: String,
    pub tasks_filter: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_tasks: usize,
    pub successful_tasks: usize,
    pub failed_tasks: usize,
    /// 百分比
    pub success_rate: f64,
    pub token_usage: TokenUsage,
    pub total_turns: u64,
    pub category_stats: BTreeMap<String, CategoryStats>,
    pub task_results: Vec<TaskResult>,
}

impl EvaluationReport {
    pub fn new(
        model: &str,
        service: &str,
        tasks_filter: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        mut task_results: Vec<TaskResult>,
    ) -> Self {
        task_results.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        let total_tasks = task_results.len();
        let successful_tasks = task_results.iter().filter(|r| r.success).count();

        let mut token_usage = TokenUsage::default();
        let mut total_turns = 0u64;
        let mut category_stats: BTreeMap<String, CategoryStats> = BTreeMap::new();
        let mut category_time: BTreeMap<String, f64> = BTreeMap::new();
        for r in &task_results {
            token_usage.add(&r.token_usage);
            total_turns += u64::from(r.turn_count);
            let stats = category_stats.entry(r.category.clone()).or_default();
            stats.total += 1;
            if r.success {
                stats.successful += 1;
            } else {
                stats.failed += 1;
            }
            *category_time.entry(r.category.clone()).or_default() += r.execution_time;
        }
        for (category, stats) in category_stats.iter_mut() {
            stats.success_rate = percent(stats.successful, stats.total);
            stats.avg_execution_time =
                category_time.get(category).copied().unwrap_or_default() / stats.total as f64;
        }

        Self {
            model: model.to_string(),
            service: service.to_string(),
            tasks_filter: tasks_filter.to_string(),
            start_time,
            end_time,
            total_tasks,
            successful_tasks,
            failed_tasks: total_tasks - successful_tasks,
            success_rate: percent(successful_tasks, total_tasks),
            token_usage,
            total_turns,
            category_stats,
            task_results,
        }
    }
}

fn percent(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}
