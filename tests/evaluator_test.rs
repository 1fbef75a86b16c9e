//! 评测编排集成测试：验证失败与 Cleanup、续跑幂等、Setup 失败、取消

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use taskbench::agent::Agent;
use taskbench::core::{BenchError, ErrorCategory};
use taskbench::evaluation::{Evaluator, ResultStore};
use taskbench::llm::mock::{text_reply, tool_call_reply};
use taskbench::llm::MockLlmClient;
use taskbench::task::{
    DirectoryTaskManager, FilesystemStateManager, NoopStateManager, StateManager, Task,
};
use taskbench::tools::{FnTool, ServiceConfig, Tool, ToolHost, ToolHostLauncher, ToolRegistry};
use tokio_util::sync::CancellationToken;

const CHECK_FILE: &str = r#"test -f "$FILESYSTEM_TEST_DIR/X.txt" && test -s "$TASKBENCH_MESSAGES""#;
const ALWAYS_FAIL: &str = "echo 'X.txt missing' >&2\nexit 1\n";

fn make_task(root: &Path, id: &str, verify: &str) {
    let dir = root.join("filesystem").join("basic").join(id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("description.md"), "Create a file named X.txt").unwrap();
    std::fs::write(dir.join("verify.py"), verify).unwrap();
}

fn tasks_fixture() -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    make_task(root.path(), "task_1", CHECK_FILE);
    make_task(root.path(), "task_2", ALWAYS_FAIL);
    root
}

fn task_manager(root: &Path) -> Arc<DirectoryTaskManager> {
    Arc::new(DirectoryTaskManager::new(root, "filesystem").with_interpreter("sh"))
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps for an hour"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok("late".into())
    }
}

/// 在 test_directory 沙箱中提供 write_file 工具
#[derive(Default)]
struct SandboxLauncher {
    launches: AtomicUsize,
}

#[async_trait]
impl ToolHostLauncher for SandboxLauncher {
    async fn launch(
        &self,
        _service: &str,
        cfg: &ServiceConfig,
    ) -> Result<Box<dyn ToolHost>, BenchError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let root = PathBuf::from(cfg.get("test_directory").cloned().unwrap_or_default());
        let registry = ToolRegistry::new("filesystem")
            .with_tool(FnTool::new("write_file", "Write a file", move |args: Value| {
                let path = args["path"].as_str().ok_or("path is required")?;
                std::fs::write(root.join(path), args["content"].as_str().unwrap_or_default())
                    .map_err(|e| e.to_string())?;
                Ok(format!("Wrote {path}"))
            }))
            .with_tool(SlowTool);
        Ok(Box::new(registry))
    }
}

/// 记录 Setup / Cleanup 调用次数
struct CountingState {
    inner: Box<dyn StateManager>,
    setups: AtomicUsize,
    cleanups: AtomicUsize,
}

impl CountingState {
    fn new(inner: impl StateManager + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Box::new(inner),
            setups: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StateManager for CountingState {
    async fn set_up(&self, task: &mut Task) -> Result<(), BenchError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        self.inner.set_up(task).await
    }

    async fn clean_up(&self, task: &mut Task) -> Result<(), BenchError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.inner.clean_up(task).await
    }
}

fn evaluator(
    client: Arc<MockLlmClient>,
    tasks: &Path,
    state: Arc<CountingState>,
    launcher: Arc<SandboxLauncher>,
    out: &Path,
) -> Evaluator {
    Evaluator::new(
        Agent::new(client, "gpt-4o"),
        task_manager(tasks),
        state,
        launcher,
        ResultStore::new(out, "exp", 1, "filesystem", "gpt-4o"),
    )
    .with_concurrency(1)
}

#[tokio::test]
async fn test_verification_failure_and_resume_idempotence() {
    let tasks = tasks_fixture();
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();

    let client = Arc::new(
        MockLlmClient::new()
            .with_reply(tool_call_reply(
                "call_w",
                "write_file",
                json!({ "path": "X.txt", "content": "hello" }),
            ))
            .with_reply(text_reply("Created X.txt"))
            .with_reply(text_reply("I could not do it")),
    );
    let state = CountingState::new(FilesystemStateManager::new(work.path()));
    let launcher = Arc::new(SandboxLauncher::default());
    let first = evaluator(client.clone(), tasks.path(), state.clone(), launcher.clone(), out.path());

    let report = first.run("all").await.unwrap();

    assert_eq!(report.total_tasks, 2);
    assert_eq!(report.successful_tasks, 1);
    assert_eq!(report.failed_tasks, 1);
    assert_eq!(client.call_count(), 3);
    assert_eq!(state.setups.load(Ordering::SeqCst), 2);
    assert_eq!(state.cleanups.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);

    let passed = &report.task_results[0];
    assert_eq!(passed.task_name, "basic/task_1");
    assert!(passed.success);
    assert_eq!(passed.turn_count, 2);

    let failed = &report.task_results[1];
    assert_eq!(failed.task_name, "basic/task_2");
    assert_eq!(failed.error_message.as_deref(), Some("Verification failed"));
    assert_eq!(failed.error_category, Some(ErrorCategory::VerificationFailed));
    assert!(failed.error_detail.as_deref().unwrap_or_default().contains("X.txt missing"));

    let run_dir = first.store().run_dir().to_path_buf();
    assert!(run_dir.join("basic__task_1/messages.json").is_file());
    assert!(run_dir.join("basic__task_1/meta.json").is_file());
    assert!(run_dir.join("summary.json").is_file());

    // 第二次运行：两个结果都不可重试，直接复用，不再调用模型
    let again_client = Arc::new(MockLlmClient::new());
    let again_state = CountingState::new(FilesystemStateManager::new(work.path()));
    let second = evaluator(
        again_client.clone(),
        tasks.path(),
        again_state.clone(),
        launcher.clone(),
        out.path(),
    );
    let again = second.run("all").await.unwrap();

    assert_eq!(again_client.call_count(), 0);
    assert_eq!(again_state.setups.load(Ordering::SeqCst), 0);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(again.total_tasks, 2);
    assert_eq!(again.successful_tasks, 1);
    assert_eq!(again.task_results[1].error_message.as_deref(), Some("Verification failed"));
}

#[tokio::test]
async fn test_setup_failure_skips_execution_and_is_retried() {
    let tasks = tasks_fixture();
    let work = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let launcher = Arc::new(SandboxLauncher::default());
    let client = Arc::new(MockLlmClient::new());
    let broken = || {
        CountingState::new(
            FilesystemStateManager::new(work.path()).with_template("/definitely/not/here"),
        )
    };

    let state = broken();
    let first = evaluator(client.clone(), tasks.path(), state.clone(), launcher.clone(), out.path());
    let report = first.run("basic/task_1").await.unwrap();

    assert_eq!(report.total_tasks, 1);
    let result = &report.task_results[0];
    assert!(!result.success);
    assert_eq!(result.error_category, Some(ErrorCategory::StateDuplicationError));
    assert!(result
        .error_message
        .as_deref()
        .unwrap_or_default()
        .starts_with("State duplication error"));
    assert_eq!(state.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    assert_eq!(client.call_count(), 0);

    // 状态复制失败可重试：下一次运行会重新执行该任务
    let state = broken();
    let second = evaluator(client.clone(), tasks.path(), state.clone(), launcher.clone(), out.path());
    second.run("basic/task_1").await.unwrap();
    assert_eq!(state.setups.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_task_runs_cleanup_and_is_not_saved() {
    let tasks = tasks_fixture();
    let out = tempfile::tempdir().unwrap();
    let client = Arc::new(MockLlmClient::new().with_reply(tool_call_reply("c1", "slow", json!({}))));
    let state = CountingState::new(NoopStateManager::new());
    let launcher = Arc::new(SandboxLauncher::default());
    let cancel = CancellationToken::new();
    let evaluator = evaluator(client, tasks.path(), state.clone(), launcher, out.path())
        .with_cancel_token(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let report = evaluator.run("basic/task_1").await.unwrap();

    assert_eq!(report.total_tasks, 0);
    assert_eq!(state.cleanups.load(Ordering::SeqCst), 1);
    assert!(!evaluator.store().run_dir().join("basic__task_1").exists());
}
