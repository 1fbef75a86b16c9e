//! 统一轨迹格式：与提供方无关的有序回合列表

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 单个回合（序列化为 `{"type": "...", ...}`）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Turn {
    User {
        content: String,
    },
    Assistant {
        content: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
    Reasoning {
        content: String,
    },
}

impl Turn {
    pub const TAGS: [&'static str; 5] = ["user", "assistant", "tool_call", "tool_result", "reasoning"];

    /// 是否由模型产生（assistant 文本、工具调用、推理块）
    pub fn is_model_authored(&self) -> bool {
        matches!(
            self,
            Turn::Assistant { .. } | Turn::ToolCall { .. } | Turn::Reasoning { .. }
        )
    }
}

/// 轨迹
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory(Vec<Turn>);

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.0.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Turn> {
        self.0.iter()
    }

    /// assistant 回合数：连续的模型产出条目（文本 + 其后的工具调用）计为一个回合
    pub fn assistant_turn_count(&self) -> usize {
        let mut count = 0;
        let mut in_run = false;
        for turn in &self.0 {
            let model = turn.is_model_authored();
            if model && !in_run {
                count += 1;
            }
            in_run = model;
        }
        count
    }

    /// 最后一条 assistant 文本
    pub fn final_answer(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|t| match t {
            Turn::Assistant { content } => Some(content.as_str()),
            _ => None,
        })
    }

    /// 以 JSON 值列表输出（可再次送入 normalize）
    pub fn to_values(&self) -> Vec<Value> {
        self.0
            .iter()
            .filter_map(|t| serde_json::to_value(t).ok())
            .collect()
    }
}

impl From<Vec<Turn>> for Trajectory {
    fn from(turns: Vec<Turn>) -> Self {
        Self(turns)
    }
}

impl IntoIterator for Trajectory {
    type Item = Turn;
    type IntoIter = std::vec::IntoIter<Turn>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
