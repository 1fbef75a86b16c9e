//! 价格表：每百万 token 的美元价格（输入 / 输出）
//!
//! 以小写模型名精确查找：先查真实模型名（meta 中的 resolved_model），再查命令行短名。
//! `[pricing.<model>]` 配置段可补充或覆盖内置条目。

use std::collections::{BTreeMap, HashMap};

use serde::{Serialize, Serializer};

use crate::config::PriceOverride;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Price {
    pub input: f64,
    pub output: f64,
}

const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    // Anthropic
    ("claude-opus-4-1-20250805", 15.0, 75.0),
    ("claude-4.1-opus", 15.0, 75.0),
    ("claude-sonnet-4-20250514", 3.0, 15.0),
    ("claude-4-sonnet", 3.0, 15.0),
    ("claude-3-5-sonnet-20241022", 3.0, 15.0),
    ("claude-3.5-sonnet", 3.0, 15.0),
    // DeepSeek
    ("deepseek-chat", 0.27, 1.1),
    ("deepseek-v3.1-non-think", 0.56, 1.68),
    // Gemini
    ("gemini-2.5-pro", 2.5, 15.0),
    ("gemini-2.5-flash", 0.3, 2.5),
    // OpenAI
    ("gpt-5-2025-08-07", 1.25, 10.0),
    ("gpt-5", 1.25, 10.0),
    ("gpt-5-mini-2025-08-07", 0.25, 2.0),
    ("gpt-5-mini", 0.25, 2.0),
    ("gpt-5-nano-2025-08-07", 0.05, 0.4),
    ("gpt-5-nano", 0.05, 0.4),
    ("gpt-4.1-2025-04-14", 2.0, 8.0),
    ("gpt-4.1", 2.0, 8.0),
    ("gpt-4.1-mini-2025-04-14", 0.4, 1.6),
    ("gpt-4.1-mini", 0.4, 1.6),
    ("gpt-4.1-nano-2025-04-14", 0.1, 0.4),
    ("gpt-4.1-nano", 0.1, 0.4),
    ("gpt-4o", 2.5, 10.0),
    ("o3-2025-04-16", 2.0, 8.0),
    ("o3", 2.0, 8.0),
    ("o4-mini-2025-04-16", 1.1, 4.4),
    ("o4-mini", 1.1, 4.4),
    ("gpt-oss-120b", 0.072, 0.28),
    // 其他
    ("glm-4.5", 0.33, 1.32),
    ("qwen3-coder-480b-a35b-instruct", 0.2, 0.8),
    ("grok-4-0709", 3.0, 15.0),
    ("kimi-k2-0905-preview", 0.6, 2.5),
];

/// 费用；价格表中没有该模型时为 unknown
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Cost {
    Usd(f64),
    Unknown,
}

impl Cost {
    pub fn usd(&self) -> Option<f64> {
        match self {
            Cost::Usd(v) => Some(*v),
            Cost::Unknown => None,
        }
    }

    /// 按运行次数平摊
    pub fn per_run(&self, k: u32) -> Cost {
        match self {
            Cost::Usd(v) if k > 0 => Cost::Usd(round4(v / f64::from(k))),
            other => *other,
        }
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Cost::Usd(v) => serializer.serialize_f64(*v),
            Cost::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

pub(crate) fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[derive(Clone, Debug)]
pub struct PriceTable {
    prices: BTreeMap<String, Price>,
}

impl Default for PriceTable {
    fn default() -> Self {
        let prices = BUILTIN_PRICES
            .iter()
            .map(|(name, input, output)| {
                (
                    name.to_string(),
                    Price {
                        input: *input,
                        output: *output,
                    },
                )
            })
            .collect();
        Self { prices }
    }
}

impl PriceTable {
    /// 内置表叠加 [pricing] 配置
    pub fn with_overrides(overrides: &HashMap<String, PriceOverride>) -> Self {
        let mut table = Self::default();
        for (name, price) in overrides {
            table.prices.insert(
                name.trim().to_lowercase(),
                Price {
                    input: price.input,
                    output: price.output,
                },
            );
        }
        table
    }

    pub fn lookup(&self, model: &str) -> Option<Price> {
        self.prices.get(&model.trim().to_lowercase()).copied()
    }

    /// 依次尝试候选名，取第一个有价格的
    pub fn cost(&self, candidates: &[&str], input_tokens: u64, output_tokens: u64) -> Cost {
        match candidates.iter().find_map(|name| self.lookup(name)) {
            Some(price) => Cost::Usd(round4(
                input_tokens as f64 / 1_000_000.0 * price.input
                    + output_tokens as f64 / 1_000_000.0 * price.output,
            )),
            None => Cost::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_lookup_is_case_insensitive() {
        let table = PriceTable::default();
        assert_eq!(
            table.cost(&["Claude-Sonnet-4-20250514"], 1_000_000, 100_000),
            Cost::Usd(4.5)
        );
        assert_eq!(table.cost(&["mystery-model"], 10, 10), Cost::Unknown);
        // 真实名查不到时回退到短名
        assert_eq!(
            table.cost(&["gpt-4.1-2099-01-01", "gpt-4.1"], 500_000, 0),
            Cost::Usd(1.0)
        );
    }

    #[test]
    fn test_overrides_and_serialization() {
        let overrides = HashMap::from([(
            "My-Model".to_string(),
            PriceOverride {
                input: 1.0,
                output: 2.0,
            },
        )]);
        let table = PriceTable::with_overrides(&overrides);
        let cost = table.cost(&["my-model"], 2_000_000, 1_000_000);
        assert_eq!(cost, Cost::Usd(4.0));
        assert_eq!(cost.per_run(4), Cost::Usd(1.0));
        assert_eq!(serde_json::to_value(Cost::Unknown).unwrap(), "unknown");
        assert_eq!(serde_json::to_value(Cost::Usd(1.5)).unwrap(), 1.5);
    }
}
