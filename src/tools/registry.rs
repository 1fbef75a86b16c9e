//! 进程内工具注册表
//!
//! 所有本地工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册；
//! ToolRegistry 本身实现 ToolHost，可直接替代外部工具宿主（测试与离线调试）。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{ToolHost, ToolHostError, ToolSpec};

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认无参数
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 由闭包构造的简单工具
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: Value,
    handler: F,
}

impl<F> FnTool<F>
where
    F: Fn(Value) -> Result<String, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: json!({ "type": "object", "properties": {}, "required": [] }),
            handler,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl<F> Tool for FnTool<F>
where
    F: Fn(Value) -> Result<String, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        (self.handler)(args)
    }
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    name: String,
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }
}

#[async_trait]
impl ToolHost for ToolRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self, _timeout: Duration) -> Result<Vec<ToolSpec>, ToolHostError> {
        Ok(self.specs())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolHostError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolHostError::UnknownTool(name.to_string()))?;
        let outcome = tokio::time::timeout(timeout, tool.execute(arguments))
            .await
            .map_err(|_| ToolHostError::Timeout {
                server: self.name.clone(),
                operation: format!("tools/call {name}"),
            })?;
        Ok(match outcome {
            Ok(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": false }),
            Err(text) => json!({ "content": [{ "type": "text", "text": text }], "isError": true }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{is_error_result, render_result};

    fn registry() -> ToolRegistry {
        ToolRegistry::new("local")
            .with_tool(FnTool::new("echo", "Echo text", |args: Value| {
                Ok(args["text"].as_str().unwrap_or_default().to_string())
            }))
            .with_tool(FnTool::new("fail", "Always fails", |_| Err("nope".to_string())))
    }

    #[tokio::test]
    async fn test_registry_lists_sorted_specs() {
        let specs = registry().list_tools(Duration::from_secs(1)).await.unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "fail"]);
    }

    #[tokio::test]
    async fn test_registry_call_and_error_flag() {
        let reg = registry();
        let ok = reg
            .call_tool("echo", json!({"text": "hi"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(render_result(&ok), "hi");

        let err = reg.call_tool("fail", json!({}), Duration::from_secs(1)).await.unwrap();
        assert!(is_error_result(&err));

        let unknown = reg.call_tool("missing", json!({}), Duration::from_secs(1)).await;
        assert!(matches!(unknown, Err(ToolHostError::UnknownTool(_))));
    }
}
