//! k 次运行汇总：pass@1 均值 / 标准差、pass@k、pass^k、用量与费用
//!
//! 读取 `{exp_dir}/run-{i}/{service}__{model}/*/meta.json`，按 (模型, 服务) 分组，
//! 以各次运行出现过的任务并集为行；某次运行缺失的任务记为失败。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregate::pricing::{round4, Cost, PriceTable};
use crate::core::BenchError;
use crate::evaluation::store::{read_meta, META_FILE, SUMMARY_FILE};
use crate::llm::TokenUsage;

/// 某任务在某次运行中的结果
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunCell {
    pub success: bool,
    pub execution_time: f64,
    pub token_usage: TokenUsage,
    pub turns: u32,
}

/// 一个 (模型, 服务) 的结果矩阵：任务名 → 每次运行的结果
#[derive(Clone, Debug, Default)]
pub struct ResultMatrix {
    pub resolved_model: Option<String>,
    pub tasks: BTreeMap<String, Vec<Option<RunCell>>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct PassAt1 {
    pub avg: f64,
    pub std: f64,
}

/// 每次运行的成功率取均值与总体标准差
pub fn pass_at_1(rows: &[Vec<bool>], k: u32) -> PassAt1 {
    if rows.is_empty() || k == 0 {
        return PassAt1::default();
    }
    let n = rows.len() as f64;
    let rates: Vec<f64> = (0..k as usize)
        .map(|run| rows.iter().filter(|r| r.get(run).copied().unwrap_or(false)).count() as f64 / n)
        .collect();
    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
    PassAt1 {
        avg: round4(mean),
        std: round4(variance.sqrt()),
    }
}

/// k 次中至少一次成功的任务比例；k = 1 时等于 pass@1
pub fn pass_at_k(rows: &[Vec<bool>], k: u32) -> f64 {
    if k <= 1 {
        return pass_at_1(rows, 1).avg;
    }
    fraction(rows, |r| r.iter().take(k as usize).any(|s| *s))
}

/// k 次全部成功的任务比例；k = 1 时等于 pass@1
pub fn pass_pow_k(rows: &[Vec<bool>], k: u32) -> f64 {
    if k <= 1 {
        return pass_at_1(rows, 1).avg;
    }
    fraction(rows, |r| r.len() >= k as usize && r.iter().take(k as usize).all(|s| *s))
}

fn fraction(rows: &[Vec<bool>], pred: impl Fn(&Vec<bool>) -> bool) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    round4(rows.iter().filter(|r| pred(r)).count() as f64 / rows.len() as f64)
}

/// 汇总行
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metrics {
    pub total_tasks: usize,
    #[serde(rename = "pass@1")]
    pub pass_at_1: PassAt1,
    #[serde(rename = "pass@k", skip_serializing_if = "Option::is_none")]
    pub pass_at_k: Option<f64>,
    #[serde(rename = "pass^k", skip_serializing_if = "Option::is_none")]
    pub pass_pow_k: Option<f64>,
    pub total_agent_execution_time: f64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_turns: u64,
    pub avg_agent_execution_time: f64,
    pub avg_input_tokens: f64,
    pub avg_output_tokens: f64,
    pub avg_total_tokens: f64,
    pub avg_turns: f64,
    pub per_run_input_tokens: f64,
    pub per_run_output_tokens: f64,
    pub per_run_cost: Cost,
}

impl Metrics {
    pub fn compute(
        cells: &[&Vec<Option<RunCell>>],
        k: u32,
        price_names: &[&str],
        prices: &PriceTable,
    ) -> Self {
        let rows: Vec<Vec<bool>> = cells
            .iter()
            .map(|row| row.iter().map(|c| matches!(c, Some(cell) if cell.success)).collect())
            .collect();

        let mut usage = TokenUsage::default();
        let mut time = 0.0;
        let mut turns = 0u64;
        for cell in cells.iter().flat_map(|row| row.iter().flatten()) {
            usage.add(&cell.token_usage);
            time += cell.execution_time;
            turns += u64::from(cell.turns);
        }

        let k = k.max(1);
        let runs = f64::from(k);
        let samples = (rows.len() as f64 * runs).max(1.0);
        let total_cost = prices.cost(price_names, usage.input_tokens, usage.output_tokens);

        Self {
            total_tasks: rows.len(),
            pass_at_1: pass_at_1(&rows, k),
            pass_at_k: (k > 1).then(|| pass_at_k(&rows, k)),
            pass_pow_k: (k > 1).then(|| pass_pow_k(&rows, k)),
            total_agent_execution_time: round4(time),
            total_input_tokens: usage.input_tokens,
            total_output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            total_turns: turns,
            avg_agent_execution_time: round4(time / samples),
            avg_input_tokens: round4(usage.input_tokens as f64 / samples),
            avg_output_tokens: round4(usage.output_tokens as f64 / samples),
            avg_total_tokens: round4(usage.total_tokens as f64 / samples),
            avg_turns: round4(turns as f64 / samples),
            per_run_input_tokens: round4(usage.input_tokens as f64 / runs),
            per_run_output_tokens: round4(usage.output_tokens as f64 / runs),
            per_run_cost: total_cost.per_run(k),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelSummary {
    pub overall: Metrics,
    pub services: BTreeMap<String, Metrics>,
}

/// 实验级 summary.json
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExperimentSummary {
    pub exp_name: String,
    pub k: u32,
    pub generated_at: DateTime<Utc>,
    pub models: BTreeMap<String, ModelSummary>,
}

/// 实验目录下的 run-N 目录，按 N 排序
pub fn discover_runs(exp_dir: &Path) -> Result<Vec<(u32, PathBuf)>, BenchError> {
    let mut runs = Vec::new();
    for entry in std::fs::read_dir(exp_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(index) = name.strip_prefix("run-").and_then(|n| n.parse::<u32>().ok()) {
            runs.push((index, entry.path()));
        }
    }
    runs.sort_by_key(|(index, _)| *index);
    Ok(runs)
}

/// 读取 k 次运行，按 (模型, 服务) 建立结果矩阵。
/// 给定 k 时读取 run-1..=k（缺失的运行目录整列记为失败），否则使用发现的全部运行。
pub fn collect(
    exp_dir: &Path,
    k: Option<u32>,
) -> Result<(u32, BTreeMap<(String, String), ResultMatrix>), BenchError> {
    let runs: Vec<PathBuf> = match k {
        Some(k) => (1..=k).map(|i| exp_dir.join(format!("run-{i}"))).collect(),
        None => discover_runs(exp_dir)?.into_iter().map(|(_, p)| p).collect(),
    };
    let k = runs.len() as u32;

    let mut groups: BTreeMap<(String, String), ResultMatrix> = BTreeMap::new();
    for (column, run_dir) in runs.iter().enumerate() {
        if !run_dir.is_dir() {
            tracing::warn!(run = %run_dir.display(), "Run directory missing, counted as failures");
            continue;
        }
        for group_dir in std::fs::read_dir(run_dir)? {
            let group_dir = group_dir?;
            let is_group = group_dir.file_name().to_string_lossy().contains("__");
            if !group_dir.file_type()?.is_dir() || !is_group {
                continue;
            }
            for task_dir in std::fs::read_dir(group_dir.path())? {
                let task_dir = task_dir?;
                if !task_dir.file_type()?.is_dir() {
                    continue;
                }
                let Some(meta) = read_meta(&task_dir.path().join(META_FILE)) else {
                    continue;
                };
                let matrix = groups
                    .entry((meta.model.clone(), meta.service.clone()))
                    .or_default();
                if matrix.resolved_model.is_none() {
                    matrix.resolved_model = meta.resolved_model.clone();
                }
                let row = matrix
                    .tasks
                    .entry(meta.task_name.clone())
                    .or_insert_with(|| vec![None; k as usize]);
                row[column] = Some(RunCell {
                    success: meta.execution_result.success,
                    execution_time: meta.execution_time,
                    token_usage: meta.token_usage,
                    turns: meta.turn_count,
                });
            }
        }
    }
    Ok((k, groups))
}

/// 计算实验汇总（每个模型一个总体行与各服务行）
pub fn summarize(
    exp_dir: &Path,
    k: Option<u32>,
    prices: &PriceTable,
) -> Result<ExperimentSummary, BenchError> {
    let (k, groups) = collect(exp_dir, k)?;

    let mut by_model: BTreeMap<String, Vec<(String, ResultMatrix)>> = BTreeMap::new();
    for ((model, service), matrix) in groups {
        by_model.entry(model).or_default().push((service, matrix));
    }

    let mut models = BTreeMap::new();
    for (model, services) in by_model {
        let resolved = services
            .iter()
            .find_map(|(_, m)| m.resolved_model.clone())
            .unwrap_or_default();
        let names = [resolved.as_str(), model.as_str()];

        let mut rows = BTreeMap::new();
        for (service, matrix) in &services {
            let cells: Vec<_> = matrix.tasks.values().collect();
            rows.insert(service.clone(), Metrics::compute(&cells, k, &names, prices));
        }
        let all: Vec<_> = services.iter().flat_map(|(_, m)| m.tasks.values()).collect();
        let overall = Metrics::compute(&all, k, &names, prices);
        models.insert(
            model,
            ModelSummary {
                overall,
                services: rows,
            },
        );
    }

    let exp_name = exp_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    Ok(ExperimentSummary {
        exp_name,
        k,
        generated_at: Utc::now(),
        models,
    })
}

/// 计算并写出 `{exp_dir}/summary.json`
pub fn aggregate(
    exp_dir: &Path,
    k: Option<u32>,
    prices: &PriceTable,
) -> Result<(ExperimentSummary, PathBuf), BenchError> {
    let summary = summarize(exp_dir, k, prices)?;
    let path = exp_dir.join(SUMMARY_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
    tracing::info!(
        models = summary.models.len(),
        k = summary.k,
        summary = %path.display(),
        "Experiment summary written"
    );
    Ok((summary, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_metrics_boundaries() {
        let rows = vec![vec![true, true], vec![true, false], vec![false, false]];
        let p1 = pass_at_1(&rows, 2);
        assert_eq!(p1.avg, 0.5);
        assert_eq!(p1.std, 0.1667);
        assert_eq!(pass_at_k(&rows, 2), 0.6667);
        assert_eq!(pass_pow_k(&rows, 2), 0.3333);

        let single = vec![vec![true], vec![false], vec![true], vec![true]];
        assert_eq!(pass_at_1(&single, 1), PassAt1 { avg: 0.75, std: 0.0 });
        assert_eq!(pass_at_k(&single, 1), 0.75);
        assert_eq!(pass_pow_k(&single, 1), 0.75);

        assert_eq!(pass_at_1(&[], 3), PassAt1::default());
        assert_eq!(pass_at_k(&[], 3), 0.0);
    }

    #[test]
    fn test_single_run_omits_pass_at_k() {
        let row = vec![Some(RunCell {
            success: true,
            ..Default::default()
        })];
        let metrics = Metrics::compute(&[&row], 1, &["unknown-model"], &PriceTable::default());
        assert_eq!(metrics.pass_at_k, None);
        assert_eq!(metrics.pass_pow_k, None);
        assert_eq!(metrics.per_run_cost, Cost::Unknown);
        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("pass@k").is_none());
        assert_eq!(json["pass@1"]["avg"], 1.0);
        assert_eq!(json["per_run_cost"], "unknown");
    }
}
