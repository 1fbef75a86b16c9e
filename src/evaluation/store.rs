//! 结果存储：每个任务一个目录（meta.json + messages.json），每次运行一个 summary.json
//!
//! 目录布局：
//! `{output_dir}/{exp_name}/run-{i}/{service}__{model}/{category}__{task_id}/`
//! 模型名中的 `.` 与 `/` 替换为 `-`，类别中的 `_` 替换为 `-`。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{BenchError, ErrorCategory};
use crate::evaluation::{EvaluationReport, TaskResult};
use crate::llm::TokenUsage;
use crate::task::Task;
use crate::trajectory::Trajectory;

pub const META_FILE: &str = "meta.json";
pub const MESSAGES_FILE: &str = "messages.json";
pub const SUMMARY_FILE: &str = "summary.json";

pub fn model_slug(model: &str) -> String {
    model.replace(['.', '/'], "-")
}

pub fn category_slug(category: &str) -> String {
    category.replace('_', "-")
}

/// meta.json 中的执行结论
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

/// meta.json
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskMeta {
    pub task_name: String,
    pub category: String,
    pub task_id: String,
    pub model: String,
    pub service: String,
    #[serde(default)]
    pub resolved_model: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub execution_time: f64,
    pub execution_result: ExecutionResult,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub turn_count: u32,
}

impl TaskMeta {
    pub fn new(
        result: &TaskResult,
        model: &str,
        service: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            task_name: result.task_name.clone(),
            category: result.category.clone(),
            task_id: result.task_id.clone(),
            model: model.to_string(),
            service: service.to_string(),
            resolved_model: result.resolved_model.clone(),
            start_time,
            end_time,
            execution_time: result.execution_time,
            execution_result: ExecutionResult {
                success: result.success,
                error_message: result.error_message.clone(),
                error_category: result.error_category,
                error_detail: result.error_detail.clone(),
            },
            token_usage: result.token_usage,
            turn_count: result.turn_count,
        }
    }

    /// 还原为任务结果（轨迹不随 meta 加载）
    pub fn into_result(self) -> TaskResult {
        TaskResult {
            task_name: self.task_name,
            category: self.category,
            task_id: self.task_id,
            success: self.execution_result.success,
            execution_time: self.execution_time,
            error_message: self.execution_result.error_message,
            error_category: self.execution_result.error_category,
            error_detail: self.execution_result.error_detail,
            token_usage: self.token_usage,
            turn_count: self.turn_count,
            resolved_model: self.resolved_model,
            model_output: Trajectory::new(),
        }
    }
}

/// 读取 meta.json；文件缺失返回 None，内容损坏时记录警告并返回 None
pub fn read_meta(path: &Path) -> Option<TaskMeta> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to read task meta");
            return None;
        }
    };
    match serde_json::from_str(&data) {
        Ok(meta) => Some(meta),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Malformed task meta, ignoring");
            None
        }
    }
}

/// 一次 (模型, 服务, 运行) 的结果目录
#[derive(Clone, Debug)]
pub struct ResultStore {
    run_dir: PathBuf,
    model: String,
    service: String,
}

impl ResultStore {
    pub fn new(
        output_dir: impl AsRef<Path>,
        exp_name: &str,
        run_index: u32,
        service: &str,
        model: &str,
    ) -> Self {
        let run_dir = output_dir
            .as_ref()
            .join(exp_name)
            .join(format!("run-{run_index}"))
            .join(format!("{service}__{}", model_slug(model)));
        Self {
            run_dir,
            model: model.to_string(),
            service: service.to_string(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn task_dir(&self, task: &Task) -> PathBuf {
        self.run_dir
            .join(format!("{}__{}", category_slug(&task.category), task.task_id))
    }

    /// 已保存的结果（损坏的 meta 视为不存在）
    pub fn load(&self, task: &Task) -> Option<TaskResult> {
        read_meta(&self.task_dir(task).join(META_FILE)).map(TaskMeta::into_result)
    }

    /// 删除任务目录，以便重新执行
    pub fn discard(&self, task: &Task) -> Result<(), BenchError> {
        let dir = self.task_dir(task);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn save_messages(&self, task: &Task, trajectory: &Trajectory) -> Result<PathBuf, BenchError> {
        let dir = self.task_dir(task);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(MESSAGES_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(trajectory)?)?;
        Ok(path)
    }

    pub fn save_meta(
        &self,
        task: &Task,
        result: &TaskResult,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<PathBuf, BenchError> {
        let dir = self.task_dir(task);
        std::fs::create_dir_all(&dir)?;
        let meta = TaskMeta::new(result, &self.model, &self.service, start_time, end_time);
        let path = dir.join(META_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&meta)?)?;
        Ok(path)
    }

    /// 本次运行目录下全部已保存结果
    pub fn load_all(&self) -> Result<Vec<TaskResult>, BenchError> {
        if !self.run_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in std::fs::read_dir(&self.run_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(meta) = read_meta(&entry.path().join(META_FILE)) {
                results.push(meta.into_result());
            }
        }
        results.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        Ok(results)
    }

    pub fn save_summary(&self, report: &EvaluationReport) -> Result<PathBuf, BenchError> {
        std::fs::create_dir_all(&self.run_dir)?;
        let path = self.run_dir.join(SUMMARY_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(report)?)?;
        Ok(path)
    }
}
