//! 用量统计：每个 Agent 实例持有一个 UsageTracker，跨多次 execute 累计，可单独重置

use std::sync::Mutex;

use serde::Serialize;

use crate::llm::TokenUsage;

/// 累计统计快照
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub reasoning_tokens: u64,
    pub turns: u64,
    pub execution_time_secs: f64,
}

impl UsageStats {
    pub fn avg_turns(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.turns as f64 / self.executions as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct UsageTracker {
    inner: Mutex<UsageStats>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次执行结果
    pub fn update(&self, success: bool, usage: &TokenUsage, turns: u32, execution_time_secs: f64) {
        let mut stats = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        stats.executions += 1;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.input_tokens += usage.input_tokens;
        stats.output_tokens += usage.output_tokens;
        stats.total_tokens += usage.total_tokens;
        stats.reasoning_tokens += usage.reasoning_tokens;
        stats.turns += u64::from(turns);
        stats.execution_time_secs += execution_time_secs;
    }

    pub fn stats(&self) -> UsageStats {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = UsageStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates_and_resets() {
        let tracker = UsageTracker::new();
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
            reasoning_tokens: 5,
        };
        tracker.update(true, &usage, 2, 1.5);
        tracker.update(false, &usage, 4, 0.5);

        let stats = tracker.stats();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_tokens, 240);
        assert_eq!(stats.reasoning_tokens, 10);
        assert_eq!(stats.turns, 6);
        assert!((stats.avg_turns() - 3.0).abs() < f64::EPSILON);
        assert!((stats.execution_time_secs - 2.0).abs() < 1e-9);

        tracker.reset();
        assert_eq!(tracker.stats(), UsageStats::default());
    }
}
