//! 任务发现、过滤、指令读取与验证脚本执行
//!
//! 目录约定：`{tasks_root}/{service}/{category}/{task}/` 下同时存在 description.md 与 verify.py 才算一个任务；
//! 以 `.` 开头的目录与 `utils` 目录不是类别。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use walkdir::WalkDir;

use crate::core::BenchError;
use crate::task::TaskResources;

const INSTRUCTION_FILE: &str = "description.md";
const VERIFY_FILE: &str = "verify.py";
const INSTRUCTION_SUFFIX: &str = "\n\nNote: Based on your understanding, solve the task all at once by yourself, don't ask for my opinions on anything.";

static TASK_ID_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// 评测任务
#[derive(Clone, Debug, PartialEq)]
pub struct Task {
    pub service: String,
    pub category: String,
    /// 任务目录名（如 `task_3` 或 `music_report`）
    pub task_id: String,
    pub instruction_path: PathBuf,
    pub verification_path: PathBuf,
    /// Setup 写入、Cleanup 清除
    pub resources: Option<TaskResources>,
}

impl Task {
    /// `category/task_id`
    pub fn name(&self) -> String {
        format!("{}/{}", self.category, self.task_id)
    }

    /// `task_N` 形式的目录名对应的 N
    pub fn numeric_id(&self) -> Option<u32> {
        let re = TASK_ID_RE
            .get_or_init(|| Regex::new(r"^task_(\d+)$").ok())
            .as_ref()?;
        re.captures(&self.task_id)?.get(1)?.as_str().parse().ok()
    }
}

/// 验证脚本的执行结果
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VerificationOutput {
    /// 超时被杀或被信号终止时为 None
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl VerificationOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// 任务协作方
#[async_trait]
pub trait TaskManager: Send + Sync {
    fn service(&self) -> &str;

    /// 发现该服务下的全部任务（按类别、编号排序）
    fn discover(&self) -> Result<Vec<Task>, BenchError>;

    /// 过滤：`all` | 类别 | `类别/任务`，否则按子串回退匹配；无匹配返回 task-not-found
    fn filter(&self, expr: &str) -> Result<Vec<Task>, BenchError> {
        let tasks = filter_tasks(self.discover()?, expr);
        if tasks.is_empty() {
            return Err(BenchError::TaskNotFound(format!(
                "No tasks matched filter '{expr}' for service {}",
                self.service()
            )));
        }
        Ok(tasks)
    }

    fn instruction_text(&self, task: &Task) -> Result<String, BenchError>;

    async fn run_verification(
        &self,
        task: &Task,
        env: &HashMap<String, String>,
    ) -> Result<VerificationOutput, BenchError>;
}

pub fn filter_tasks(tasks: Vec<Task>, expr: &str) -> Vec<Task> {
    let expr = expr.trim();
    if expr.is_empty() || expr.eq_ignore_ascii_case("all") {
        return tasks;
    }
    if tasks.iter().any(|t| t.category == expr) {
        return tasks.into_iter().filter(|t| t.category == expr).collect();
    }
    if let Some((category, id)) = expr.split_once('/') {
        if let Some(task) = tasks
            .iter()
            .find(|t| t.category == category && t.task_id == id)
        {
            return vec![task.clone()];
        }
    }
    tasks
        .into_iter()
        .filter(|t| t.category.contains(expr) || t.name().contains(expr) || t.task_id == expr)
        .collect()
}

/// 基于目录结构的任务管理器
#[derive(Clone, Debug)]
pub struct DirectoryTaskManager {
    tasks_root: PathBuf,
    service: String,
    interpreter: String,
    verify_timeout: Duration,
}

impl DirectoryTaskManager {
    pub fn new(tasks_root: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            tasks_root: tasks_root.into(),
            service: service.into(),
            interpreter: "python3".to_string(),
            verify_timeout: Duration::from_secs(90),
        }
    }

    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    fn is_category_dir(path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| !n.starts_with('.') && n != "utils")
    }
}

#[async_trait]
impl TaskManager for DirectoryTaskManager {
    fn service(&self) -> &str {
        &self.service
    }

    fn discover(&self) -> Result<Vec<Task>, BenchError> {
        let service_dir = self.tasks_root.join(&self.service);
        if !service_dir.is_dir() {
            tracing::warn!(service = %self.service, dir = %service_dir.display(), "Tasks directory does not exist");
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        for entry in WalkDir::new(&service_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let task_dir = entry.path();
            let Some(category_dir) = task_dir.parent() else {
                continue;
            };
            if !Self::is_category_dir(category_dir) {
                continue;
            }
            let task_id = entry.file_name().to_string_lossy().to_string();
            if task_id.starts_with('.') {
                continue;
            }
            let instruction_path = task_dir.join(INSTRUCTION_FILE);
            let verification_path = task_dir.join(VERIFY_FILE);
            if !(instruction_path.is_file() && verification_path.is_file()) {
                tracing::warn!(dir = %task_dir.display(), "Skipping task directory without description.md or verify.py");
                continue;
            }
            let category = category_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            tasks.push(Task {
                service: self.service.clone(),
                category,
                task_id,
                instruction_path,
                verification_path,
                resources: None,
            });
        }

        tasks.sort_by(|a, b| {
            (&a.category, a.numeric_id().unwrap_or(u32::MAX), &a.task_id).cmp(&(
                &b.category,
                b.numeric_id().unwrap_or(u32::MAX),
                &b.task_id,
            ))
        });
        tracing::info!(service = %self.service, count = tasks.len(), "Discovered tasks");
        Ok(tasks)
    }

    fn instruction_text(&self, task: &Task) -> Result<String, BenchError> {
        let text = std::fs::read_to_string(&task.instruction_path).map_err(|e| {
            BenchError::TaskNotFound(format!(
                "instruction file {} unreadable: {e}",
                task.instruction_path.display()
            ))
        })?;
        Ok(format!("{text}{INSTRUCTION_SUFFIX}"))
    }

    async fn run_verification(
        &self,
        task: &Task,
        env: &HashMap<String, String>,
    ) -> Result<VerificationOutput, BenchError> {
        let mut cmd = tokio::process::Command::new(&self.interpreter);
        cmd.arg(&task.verification_path)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(self.verify_timeout, cmd.output()).await {
            Ok(output) => {
                let output = output?;
                Ok(VerificationOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    timed_out: false,
                })
            }
            Err(_) => {
                tracing::warn!(task = %task.name(), timeout_secs = self.verify_timeout.as_secs(), "Verification timed out");
                Ok(VerificationOutput {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!(
                        "Verification timed out after {} seconds",
                        self.verify_timeout.as_secs()
                    ),
                    timed_out: true,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(root: &Path, category: &str, id: &str, verify: &str) {
        let dir = root.join("filesystem").join(category).join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(INSTRUCTION_FILE), format!("Do {id}")).unwrap();
        std::fs::write(dir.join(VERIFY_FILE), verify).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        make_task(root.path(), "desktop", "task_10", "exit 0");
        make_task(root.path(), "desktop", "task_2", "exit 0");
        make_task(root.path(), "file_context", "uppercase", "exit 3");
        std::fs::create_dir_all(root.path().join("filesystem/utils/helper")).unwrap();
        std::fs::create_dir_all(root.path().join("filesystem/desktop/incomplete")).unwrap();
        root
    }

    #[test]
    fn test_discover_sorted_and_skips_invalid() {
        let root = fixture();
        let manager = DirectoryTaskManager::new(root.path(), "filesystem");
        let names: Vec<String> = manager.discover().unwrap().iter().map(Task::name).collect();
        assert_eq!(names, ["desktop/task_2", "desktop/task_10", "file_context/uppercase"]);
    }

    #[test]
    fn test_filter_forms() {
        let root = fixture();
        let manager = DirectoryTaskManager::new(root.path(), "filesystem");
        assert_eq!(manager.filter("all").unwrap().len(), 3);
        assert_eq!(manager.filter("desktop").unwrap().len(), 2);
        let one = manager.filter("desktop/task_10").unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].numeric_id(), Some(10));
        assert_eq!(manager.filter("upper").unwrap()[0].task_id, "uppercase");
        assert!(matches!(manager.filter("nothing"), Err(BenchError::TaskNotFound(_))));
    }

    #[test]
    fn test_missing_service_dir_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let manager = DirectoryTaskManager::new(root.path(), "notion");
        assert!(manager.discover().unwrap().is_empty());
    }

    #[test]
    fn test_instruction_suffix() {
        let root = fixture();
        let manager = DirectoryTaskManager::new(root.path(), "filesystem");
        let task = &manager.filter("desktop/task_2").unwrap()[0];
        let text = manager.instruction_text(task).unwrap();
        assert!(text.starts_with("Do task_2\n\nNote: Based on your understanding"));
    }

    #[tokio::test]
    async fn test_verification_exit_codes_and_env() {
        let root = fixture();
        let manager = DirectoryTaskManager::new(root.path(), "filesystem").with_interpreter("sh");
        let task = &manager.filter("file_context/uppercase").unwrap()[0];
        let out = manager.run_verification(task, &HashMap::new()).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.passed());

        let dir = root.path().join("filesystem/desktop/task_2");
        std::fs::write(dir.join(VERIFY_FILE), "echo \"$CHECK_VALUE\"").unwrap();
        let task = &manager.filter("desktop/task_2").unwrap()[0];
        let env = HashMap::from([("CHECK_VALUE".to_string(), "seen".to_string())]);
        let out = manager.run_verification(task, &env).await.unwrap();
        assert!(out.passed());
        assert_eq!(out.stdout.trim(), "seen");
    }

    #[tokio::test]
    async fn test_verification_timeout() {
        let root = fixture();
        let dir = root.path().join("filesystem/desktop/task_2");
        std::fs::write(dir.join(VERIFY_FILE), "sleep 5").unwrap();
        let manager = DirectoryTaskManager::new(root.path(), "filesystem")
            .with_interpreter("sh")
            .with_verify_timeout(Duration::from_millis(200));
        let task = &manager.filter("desktop/task_2").unwrap()[0];
        let out = manager.run_verification(task, &HashMap::new()).await.unwrap();
        assert!(out.timed_out);
        assert!(!out.passed());
    }
}
