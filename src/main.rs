//! taskbench 命令行
//!
//! - pipeline：多模型 × k 次运行，结束后写出实验汇总；有失败任务时退出码为 1
//! - evaluate：评测单个任务（可指定预置资源）
//! - aggregate：重新计算实验汇总

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use taskbench::aggregate::{self, PriceTable};
use taskbench::config::{load_config, AppConfig};
use taskbench::evaluation::{run_pipeline, PipelineOptions};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "taskbench", version, about = "LLM agent benchmark harness")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every model k times against a service and aggregate the results
    Pipeline(PipelineArgs),
    /// Evaluate a single task
    Evaluate(EvaluateArgs),
    /// Recompute the experiment summary
    Aggregate(AggregateArgs),
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Comma-separated model names
    #[arg(long, value_delimiter = ',', required = true)]
    models: Vec<String>,
    #[arg(long)]
    service: String,
    /// all | category | category/task_N
    #[arg(long, default_value = "all")]
    tasks: String,
    #[arg(long, default_value_t = 1)]
    k: u32,
    /// Per-task execution timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    exp_name: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// default | low | medium | high
    #[arg(long)]
    reasoning_effort: Option<String>,
}

#[derive(Args, Debug)]
struct EvaluateArgs {
    #[arg(long)]
    model: String,
    #[arg(long)]
    service: String,
    /// category/task_N
    #[arg(long)]
    task: String,
    /// Pre-provisioned resource used instead of duplicating state
    #[arg(long)]
    resource_id: Option<String>,
    #[arg(long)]
    exp_name: Option<String>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    timeout: Option<u64>,
    #[arg(long)]
    reasoning_effort: Option<String>,
}

#[derive(Args, Debug)]
struct AggregateArgs {
    #[arg(long)]
    exp_dir: PathBuf,
    /// Number of runs (defaults to the run-N directories found)
    #[arg(long)]
    k: Option<u32>,
}

/// Ctrl-C 时取消正在运行的评测
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

async fn run_options(cfg: &AppConfig, opts: PipelineOptions) -> anyhow::Result<ExitCode> {
    let outcome = run_pipeline(cfg, &opts, cancel_on_ctrl_c())
        .await
        .context("Pipeline failed")?;
    for report in &outcome.reports {
        tracing::info!(
            model = %report.model,
            service = %report.service,
            passed = report.successful_tasks,
            total = report.total_tasks,
            rate = format!("{:.1}%", report.success_rate),
            "Run result"
        );
    }
    if outcome.failed_tasks > 0 {
        tracing::warn!(failed = outcome.failed_tasks, "Some tasks failed");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    taskbench::observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;

    match cli.command {
        Command::Pipeline(args) => {
            let mut opts = PipelineOptions::from_config(&cfg, args.models, args.service);
            opts.tasks = args.tasks;
            opts.k = args.k;
            opts.timeout_secs = args.timeout;
            opts.concurrency = args.concurrency;
            opts.reasoning_effort = args.reasoning_effort;
            if let Some(name) = args.exp_name {
                opts.exp_name = name;
            }
            if let Some(dir) = args.output_dir {
                opts.output_dir = dir;
            }
            run_options(&cfg, opts).await
        }
        Command::Evaluate(args) => {
            let mut opts = PipelineOptions::from_config(&cfg, vec![args.model], args.service);
            opts.tasks = args.task;
            opts.resource_id = args.resource_id;
            opts.timeout_secs = args.timeout;
            opts.reasoning_effort = args.reasoning_effort;
            if let Some(name) = args.exp_name {
                opts.exp_name = name;
            }
            if let Some(dir) = args.output_dir {
                opts.output_dir = dir;
            }
            run_options(&cfg, opts).await
        }
        Command::Aggregate(args) => {
            let prices = PriceTable::with_overrides(&cfg.pricing);
            let (summary, path) = aggregate::aggregate(&args.exp_dir, args.k, &prices)
                .with_context(|| format!("Failed to aggregate {}", args.exp_dir.display()))?;
            for (model, row) in &summary.models {
                tracing::info!(
                    model = %model,
                    pass_at_1 = row.overall.pass_at_1.avg,
                    tasks = row.overall.total_tasks,
                    "Model summary"
                );
            }
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}
