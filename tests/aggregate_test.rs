//! 实验汇总集成测试：缺失任务记为失败、pass@k / pass^k、费用

use std::path::PathBuf;

use chrono::Utc;
use taskbench::aggregate::{aggregate, Cost, PriceTable};
use taskbench::core::{ErrorCategory, ErrorInfo};
use taskbench::evaluation::{ResultStore, TaskResult};
use taskbench::llm::TokenUsage;
use taskbench::task::Task;

fn task(id: &str) -> Task {
    Task {
        service: "filesystem".into(),
        category: "basic".into(),
        task_id: id.into(),
        instruction_path: PathBuf::new(),
        verification_path: PathBuf::new(),
        resources: None,
    }
}

fn result(id: &str, success: bool) -> TaskResult {
    let t = task(id);
    let mut r = if success {
        TaskResult::passed(&t)
    } else {
        TaskResult::failed(
            &t,
            &ErrorInfo::new(ErrorCategory::VerificationFailed, "Verification failed", false),
        )
    };
    r.token_usage = TokenUsage {
        input_tokens: 1_000_000,
        output_tokens: 0,
        total_tokens: 1_000_000,
        reasoning_tokens: 0,
    };
    r.turn_count = 2;
    r.execution_time = 1.0;
    r
}

fn save(root: &std::path::Path, run: u32, model: &str, results: &[TaskResult]) {
    let store = ResultStore::new(root, "exp", run, "filesystem", model);
    let now = Utc::now();
    for r in results {
        store.save_meta(&task(&r.task_id), r, now, now).unwrap();
    }
}

#[test]
fn test_two_runs_with_missing_task() {
    let out = tempfile::tempdir().unwrap();
    save(
        out.path(),
        1,
        "gpt-4.1",
        &[result("task_1", true), result("task_2", true), result("task_3", false)],
    );
    // 第二次运行中 task_3 缺失，记为失败
    save(out.path(), 2, "gpt-4.1", &[result("task_1", true), result("task_2", false)]);

    let exp_dir = out.path().join("exp");
    let (summary, path) = aggregate(&exp_dir, Some(2), &PriceTable::default()).unwrap();
    assert_eq!(path, exp_dir.join("summary.json"));
    assert_eq!(summary.k, 2);

    let row = &summary.models["gpt-4.1"].services["filesystem"];
    assert_eq!(row.total_tasks, 3);
    assert_eq!(row.pass_at_1.avg, 0.5);
    assert_eq!(row.pass_at_1.std, 0.1667);
    assert_eq!(row.pass_at_k, Some(0.6667));
    assert_eq!(row.pass_pow_k, Some(0.3333));
    assert_eq!(row.total_input_tokens, 5_000_000);
    assert_eq!(row.total_turns, 10);
    assert_eq!(row.per_run_input_tokens, 2_500_000.0);
    // gpt-4.1：每百万输入 token 2 美元
    assert_eq!(row.per_run_cost, Cost::Usd(5.0));
    assert_eq!(summary.models["gpt-4.1"].overall, *row);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["models"]["gpt-4.1"]["overall"]["pass@k"], 0.6667);
}

#[test]
fn test_single_run_unknown_price() {
    let out = tempfile::tempdir().unwrap();
    save(out.path(), 1, "house-model", &[result("task_1", true), result("task_2", false)]);

    let (summary, _) = aggregate(&out.path().join("exp"), None, &PriceTable::default()).unwrap();

    assert_eq!(summary.k, 1);
    let row = &summary.models["house-model"].overall;
    assert_eq!(row.pass_at_1.avg, 0.5);
    assert_eq!(row.pass_at_1.std, 0.0);
    assert_eq!(row.pass_at_k, None);
    assert_eq!(row.per_run_cost, Cost::Unknown);
}
