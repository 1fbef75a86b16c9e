//! 核心层：错误分类体系、重试策略、用量统计、任务调度

pub mod classifier;
pub mod error;
pub mod task_scheduler;
pub mod usage;

pub use classifier::{classify, standardize, Classifier, RetryPolicy};
pub use error::{AgentError, BenchError, ErrorCategory, ErrorInfo};
pub use task_scheduler::TaskScheduler;
pub use usage::{UsageStats, UsageTracker};
