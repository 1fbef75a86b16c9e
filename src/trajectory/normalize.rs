//! 消息归一化：把各提供方的对话 / 工具调用表示转换为统一轨迹
//!
//! 纯函数且全定义：遇到无法识别的块直接忽略，不会失败。
//! - user：保留原文；列表内容中的 tool_result 项转为 tool_result 回合（按原 call id）
//! - assistant：先文本后工具调用；缺失的 call id 按顺序合成，旧式 function_call 记住 name → id 供 role=function 结果使用
//! - 推理块并入 assistant 文本，以 `<think>` 包裹
//! - 既无文本也无调用的 assistant 消息输出空文本占位
//! - system / developer 消息不进入轨迹；已是统一格式的条目原样通过

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::trajectory::{Trajectory, Turn};

pub fn normalize(messages: &[Value]) -> Trajectory {
    let mut normalizer = Normalizer::default();
    for message in messages {
        normalizer.message(message);
    }
    normalizer.out
}

#[derive(Default)]
struct Normalizer {
    out: Trajectory,
    legacy_ids: HashMap<String, String>,
    synthesized: usize,
}

impl Normalizer {
    fn synth_id(&mut self) -> String {
        self.synthesized += 1;
        format!("call_synth_{}", self.synthesized)
    }

    fn id_or_synth(&mut self, value: Option<&Value>) -> String {
        match value.and_then(Value::as_str).filter(|s| !s.is_empty()) {
            Some(id) => id.to_string(),
            None => self.synth_id(),
        }
    }

    fn message(&mut self, message: &Value) {
        match message {
            Value::String(text) => self.out.push(Turn::User {
                content: text.clone(),
            }),
            Value::Object(map) => match map.get("role").and_then(Value::as_str) {
                None => self.item(message, map),
                Some("system" | "developer") => {}
                Some("user") => self.user(map.get("content")),
                Some("assistant") => self.assistant(map),
                Some("tool") => {
                    let call_id = self.id_or_synth(map.get("tool_call_id"));
                    self.out.push(Turn::ToolResult {
                        call_id,
                        output: content_text(map.get("content")),
                    });
                }
                Some("function") => {
                    let name = map.get("name").and_then(Value::as_str).unwrap_or_default();
                    let call_id = match self.legacy_ids.get(name) {
                        Some(id) => id.clone(),
                        None => self.synth_id(),
                    };
                    self.out.push(Turn::ToolResult {
                        call_id,
                        output: content_text(map.get("content")),
                    });
                }
                Some(_) => {}
            },
            _ => {}
        }
    }

    /// 无 role 的条目：统一格式回合，或 Responses 风格的 function_call / function_call_output / reasoning
    fn item(&mut self, value: &Value, map: &Map<String, Value>) {
        let kind = map.get("type").and_then(Value::as_str).unwrap_or_default();
        if Turn::TAGS.contains(&kind) {
            if let Ok(turn) = serde_json::from_value::<Turn>(value.clone()) {
                self.out.push(turn);
                return;
            }
        }
        match kind {
            "function_call" => {
                let call_id = self.id_or_synth(map.get("call_id").or_else(|| map.get("id")));
                self.out.push(Turn::ToolCall {
                    call_id,
                    name: str_field(map, "name"),
                    arguments: parse_arguments(map.get("arguments")),
                });
            }
            "function_call_output" => {
                let call_id = self.id_or_synth(map.get("call_id"));
                self.out.push(Turn::ToolResult {
                    call_id,
                    output: content_text(map.get("output")),
                });
            }
            "reasoning" => {
                let text = content_text(map.get("summary"));
                if !text.is_empty() {
                    self.out.push(Turn::Reasoning { content: text });
                }
            }
            _ => {}
        }
    }

    fn user(&mut self, content: Option<&Value>) {
        match content {
            Some(Value::String(text)) => self.out.push(Turn::User {
                content: text.clone(),
            }),
            Some(Value::Array(items)) => {
                let mut text = Vec::new();
                for item in items {
                    match item {
                        Value::String(s) => text.push(s.clone()),
                        Value::Object(block) => {
                            match block.get("type").and_then(Value::as_str).unwrap_or_default() {
                                "text" | "input_text" => text.push(str_field(block, "text")),
                                "tool_result" => {
                                    self.flush_user(&mut text);
                                    let call_id = self.id_or_synth(
                                        block.get("tool_use_id").or_else(|| block.get("call_id")),
                                    );
                                    self.out.push(Turn::ToolResult {
                                        call_id,
                                        output: content_text(block.get("content")),
                                    });
                                }
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
                self.flush_user(&mut text);
            }
            _ => {}
        }
    }

    fn flush_user(&mut self, text: &mut Vec<String>) {
        if !text.is_empty() {
            self.out.push(Turn::User {
                content: text.join("\n"),
            });
            text.clear();
        }
    }

    fn assistant(&mut self, map: &Map<String, Value>) {
        let mut parts: Vec<String> = Vec::new();
        let mut calls: Vec<Turn> = Vec::new();

        if let Some(reasoning) = map.get("reasoning_content").and_then(Value::as_str) {
            if !reasoning.is_empty() {
                parts.push(wrap_thinking(reasoning));
            }
        }

        match map.get("content") {
            Some(Value::String(text)) if !text.is_empty() => parts.push(text.clone()),
            Some(Value::Array(blocks)) => {
                for block in blocks {
                    match block {
                        Value::String(s) if !s.is_empty() => parts.push(s.clone()),
                        Value::Object(b) => {
                            match b.get("type").and_then(Value::as_str).unwrap_or_default() {
                                "thinking" => {
                                    let t = str_field(b, "thinking");
                                    if !t.is_empty() {
                                        parts.push(wrap_thinking(&t));
                                    }
                                }
                                "text" | "output_text" => {
                                    let t = str_field(b, "text");
                                    if !t.is_empty() {
                                        parts.push(t);
                                    }
                                }
                                "tool_use" => {
                                    let call_id = self.id_or_synth(b.get("id"));
                                    calls.push(Turn::ToolCall {
                                        call_id,
                                        name: str_field(b, "name"),
                                        arguments: parse_arguments(b.get("input")),
                                    });
                                }
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }

        if let Some(Value::Array(tool_calls)) = map.get("tool_calls") {
            for call in tool_calls {
                let Some(obj) = call.as_object() else {
                    continue;
                };
                let function = obj.get("function").and_then(Value::as_object);
                let name = function
                    .map(|f| str_field(f, "name"))
                    .unwrap_or_else(|| str_field(obj, "name"));
                let arguments = parse_arguments(
                    function
                        .and_then(|f| f.get("arguments"))
                        .or_else(|| obj.get("arguments")),
                );
                let call_id = self.id_or_synth(obj.get("id"));
                calls.push(Turn::ToolCall {
                    call_id,
                    name,
                    arguments,
                });
            }
        }

        if let Some(Value::Object(legacy)) = map.get("function_call") {
            let name = str_field(legacy, "name");
            let call_id = self.synth_id();
            self.legacy_ids.insert(name.clone(), call_id.clone());
            calls.push(Turn::ToolCall {
                call_id,
                name,
                arguments: parse_arguments(legacy.get("arguments")),
            });
        }

        if !parts.is_empty() {
            self.out.push(Turn::Assistant {
                content: parts.join("\n\n"),
            });
        }
        let had_calls = !calls.is_empty();
        for call in calls {
            self.out.push(call);
        }
        if parts.is_empty() && !had_calls {
            self.out.push(Turn::Assistant {
                content: String::new(),
            });
        }
    }
}

fn wrap_thinking(text: &str) -> String {
    format!("<think>\n{text}\n</think>")
}

fn str_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// 工具参数：JSON 字符串解析为对象，解析失败保留原字符串；缺失视为空对象
fn parse_arguments(value: Option<&Value>) -> Value {
    match value {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::String(s)) if s.trim().is_empty() => Value::Object(Map::new()),
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
        }
        Some(other) => other.clone(),
    }
}

/// 把字符串 / 内容块列表渲染为文本
fn content_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => match other.get("text").and_then(Value::as_str) {
                    Some(t) => t.to_string(),
                    None => other.to_string(),
                },
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
    }
}
