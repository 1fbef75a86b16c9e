//! 多模型流水线：对每个模型执行 k 次运行，最后汇总实验结果

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::aggregate::{self, ExperimentSummary, PriceTable};
use crate::agent::Agent;
use crate::config::AppConfig;
use crate::core::{BenchError, Classifier};
use crate::evaluation::{EvaluationReport, Evaluator, ResultStore};
use crate::llm::ModelConfig;
use crate::task::{state_manager_for, DirectoryTaskManager};
use crate::tools::McpLauncher;

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub models: Vec<String>,
    pub service: String,
    pub tasks: String,
    pub k: u32,
    pub exp_name: String,
    pub output_dir: PathBuf,
    /// 未指定时使用 [evaluation] concurrency
    pub concurrency: Option<usize>,
    /// 单次执行整体超时（秒），未指定时使用 [agent] timeout_secs
    pub timeout_secs: Option<u64>,
    pub reasoning_effort: Option<String>,
    /// 预置资源（跳过状态复制）
    pub resource_id: Option<String>,
}

impl PipelineOptions {
    /// 以配置中的 [app] 段为默认值
    pub fn from_config(cfg: &AppConfig, models: Vec<String>, service: impl Into<String>) -> Self {
        Self {
            models,
            service: service.into(),
            tasks: "all".to_string(),
            k: 1,
            exp_name: cfg.app.exp_name.clone(),
            output_dir: cfg.app.output_dir.clone(),
            concurrency: None,
            timeout_secs: None,
            reasoning_effort: None,
            resource_id: None,
        }
    }

    pub fn exp_dir(&self) -> PathBuf {
        self.output_dir.join(&self.exp_name)
    }
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub reports: Vec<EvaluationReport>,
    pub failed_tasks: usize,
    /// 被取消时不汇总
    pub summary: Option<ExperimentSummary>,
}

/// 为一个 (模型, 运行) 组装评测器
pub fn build_evaluator(
    cfg: &AppConfig,
    opts: &PipelineOptions,
    model: &str,
    run_index: u32,
    cancel: CancellationToken,
) -> Result<Evaluator, BenchError> {
    let model_cfg = ModelConfig::resolve(model)?;
    let client = model_cfg.create_client(&cfg.llm)?;

    let mut agent = Agent::from_config(client, &model_cfg.actual_model_name, cfg);
    if let Some(secs) = opts.timeout_secs {
        agent = agent.with_timeout(Duration::from_secs(secs));
    }
    if let Some(effort) = &opts.reasoning_effort {
        agent = agent.with_reasoning_effort(effort.clone());
    }

    let task_manager = DirectoryTaskManager::new(&cfg.app.tasks_root, &opts.service)
        .with_interpreter(&cfg.evaluation.verify_interpreter)
        .with_verify_timeout(Duration::from_secs(cfg.evaluation.verify_timeout_secs));
    let state_manager = state_manager_for(&opts.service, cfg, opts.resource_id.clone());
    let store = ResultStore::new(&opts.output_dir, &opts.exp_name, run_index, &opts.service, model);

    Ok(Evaluator::new(
        agent,
        Arc::new(task_manager),
        Arc::from(state_manager),
        Arc::new(McpLauncher::default()),
        store,
    )
    .with_service_config(cfg.service(&opts.service))
    .with_concurrency(opts.concurrency.unwrap_or(cfg.evaluation.concurrency))
    .with_classifier(Classifier::from_overrides(&cfg.retry))
    .with_cancel_token(cancel))
}

/// 依次运行 模型 × 运行次数，然后写出实验汇总
pub async fn run_pipeline(
    cfg: &AppConfig,
    opts: &PipelineOptions,
    cancel: CancellationToken,
) -> Result<PipelineOutcome, BenchError> {
    if opts.models.is_empty() {
        return Err(BenchError::ConfigMissing("at least one model is required".to_string()));
    }
    let k = opts.k.max(1);
    let mut reports = Vec::new();
    let mut failed_tasks = 0;

    'outer: for model in &opts.models {
        for run_index in 1..=k {
            if cancel.is_cancelled() {
                break 'outer;
            }
            tracing::info!(
                model = %model,
                service = %opts.service,
                run = run_index,
                k,
                "Pipeline run started"
            );
            let evaluator = build_evaluator(cfg, opts, model, run_index, cancel.clone())?;
            let report = evaluator.run(&opts.tasks).await?;
            failed_tasks += report.failed_tasks;
            reports.push(report);
        }
    }

    if cancel.is_cancelled() {
        tracing::warn!("Pipeline cancelled, experiment summary not updated");
        return Ok(PipelineOutcome {
            reports,
            failed_tasks,
            summary: None,
        });
    }

    let prices = PriceTable::with_overrides(&cfg.pricing);
    let (summary, _) = aggregate::aggregate(&opts.exp_dir(), Some(k), &prices)?;
    Ok(PipelineOutcome {
        reports,
        failed_tasks,
        summary: Some(summary),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_model_list_rejected() {
        let cfg = AppConfig::default();
        let opts = PipelineOptions::from_config(&cfg, Vec::new(), "filesystem");
        let err = run_pipeline(&cfg, &opts, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, BenchError::ConfigMissing(_)));
    }

    #[test]
    fn test_unknown_model_is_config_error() {
        let cfg = AppConfig::default();
        let opts = PipelineOptions::from_config(&cfg, vec!["gpt-4o".into()], "filesystem");
        // 未知提供方在组装阶段即失败，不会启动任何任务
        let result = build_evaluator(&cfg, &opts, "no-such-provider/", 1, CancellationToken::new());
        assert!(result.is_err());
        assert_eq!(opts.exp_dir(), PathBuf::from("./results/test-run"));
    }
}
