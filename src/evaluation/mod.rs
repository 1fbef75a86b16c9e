//! 评测层：任务编排、结果存储与报告、多模型流水线

pub mod evaluator;
pub mod pipeline;
pub mod report;
pub mod store;

pub use evaluator::{Evaluator, MESSAGES_ENV};
pub use pipeline::{build_evaluator, run_pipeline, PipelineOptions, PipelineOutcome};
pub use report::{CategoryStats, EvaluationReport, TaskResult};
pub use store::{ResultStore, TaskMeta};
