//! 部分进度快照
//!
//! 策略在每个回合结束后写入 {提供方消息, 累计用量, 回合数}；
//! 外层超时或取消时由 Agent 读取最后一次快照，重建轨迹而不是空手返回。

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::llm::TokenUsage;
use crate::trajectory::{normalize, Trajectory};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProgressSnapshot {
    /// 提供方原生消息（不含 system）
    pub messages: Vec<Value>,
    pub usage: TokenUsage,
    pub turn_count: u32,
    pub resolved_model: Option<String>,
}

impl ProgressSnapshot {
    pub fn trajectory(&self) -> Trajectory {
        normalize(&self.messages)
    }
}

/// 可跨任务共享的快照记录器（克隆后指向同一份快照）
#[derive(Clone, Debug, Default)]
pub struct ProgressRecorder {
    inner: Arc<Mutex<ProgressSnapshot>>,
}

impl ProgressRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        messages: &[Value],
        usage: TokenUsage,
        turn_count: u32,
        resolved_model: Option<&str>,
    ) {
        let mut snapshot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        snapshot.messages = messages.to_vec();
        snapshot.usage = usage;
        snapshot.turn_count = turn_count;
        snapshot.resolved_model = resolved_model.map(String::from);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
