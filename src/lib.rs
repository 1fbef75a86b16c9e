//! taskbench - LLM 智能体基准评测框架
//!
//! 模块划分：
//! - **agent**: Agent 执行入口（策略选择、外层超时、整段重试、用量统计）
//! - **aggregate**: k 次运行汇总（pass@1 / pass@k / pass^k、费用）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类别与分类器、重试策略、用量统计、任务调度
//! - **evaluation**: Setup → Execute → Verify → Cleanup 编排、结果存储、流水线
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Anthropic / Mock）与模型配置
//! - **observability**: 日志初始化
//! - **strategy**: 回合循环（原生 / 通用两种执行策略）与部分进度快照
//! - **task**: 任务发现、验证与状态管理
//! - **tools**: 工具宿主（stdio / HTTP 协议客户端、进程内注册表）与执行器
//! - **trajectory**: 统一轨迹格式与消息规范化

pub mod agent;
pub mod aggregate;
pub mod config;
pub mod core;
pub mod evaluation;
pub mod llm;
pub mod observability;
pub mod strategy;
pub mod task;
pub mod tools;
pub mod trajectory;

pub use agent::Agent;
pub use evaluation::{Evaluator, EvaluationReport, TaskResult};
pub use strategy::{ExecutionOutcome, StrategyKind};
