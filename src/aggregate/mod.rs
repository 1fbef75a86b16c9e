//! 结果汇总：k 次运行的 pass@1 / pass@k / pass^k 与费用估算

pub mod k_runs;
pub mod pricing;

pub use k_runs::{
    aggregate, pass_at_1, pass_at_k, pass_pow_k, summarize, ExperimentSummary, Metrics,
    ModelSummary, PassAt1,
};
pub use pricing::{Cost, Price, PriceTable};
