//! HTTP 工具宿主（streamable HTTP）：每个 JSON-RPC 请求一次 POST，
//! 响应体可以是 JSON 或 SSE（`data:` 事件），会话 id 通过 `Mcp-Session-Id` 头维持。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;

use super::protocol;
use crate::tools::{ToolHost, ToolHostError, ToolSpec};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP 端点参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpSpec {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

pub struct HttpToolHost {
    name: String,
    spec: HttpSpec,
    http: reqwest::Client,
    session_id: AsyncMutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpToolHost {
    pub async fn connect(name: &str, spec: &HttpSpec, timeout: Duration) -> Result<Self, ToolHostError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ToolHostError::Transport {
                server: name.to_string(),
                message: e.to_string(),
            })?;
        let host = Self {
            name: name.to_string(),
            spec: spec.clone(),
            http,
            session_id: AsyncMutex::new(None),
            next_id: AtomicU64::new(1),
        };
        host.request("initialize", protocol::initialize_params(), timeout)
            .await?;
        host.post(
            &protocol::notification("notifications/initialized", json!({})),
            timeout,
        )
        .await?;
        tracing::info!(server = %name, url = %spec.url, "HTTP tool host connected");
        Ok(host)
    }

    fn transport(&self, message: impl Into<String>) -> ToolHostError {
        ToolHostError::Transport {
            server: self.name.clone(),
            message: message.into(),
        }
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, ToolHostError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let messages = self
            .post(&protocol::request(id, method, params), timeout)
            .await
            .map_err(|e| match e {
                ToolHostError::Timeout { server, .. } => ToolHostError::Timeout {
                    server,
                    operation: method.to_string(),
                },
                other => other,
            })?;
        let reply = messages
            .into_iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(id))
            .ok_or_else(|| self.transport(format!("no response for '{method}'")))?;
        protocol::into_result(&self.name, reply)
    }

    /// 发送一条报文，返回响应体中解析出的全部 JSON-RPC 消息
    async fn post(&self, payload: &Value, timeout: Duration) -> Result<Vec<Value>, ToolHostError> {
        let mut builder = self
            .http
            .post(&self.spec.url)
            .timeout(timeout)
            .header("Accept", "application/json, text/event-stream")
            .json(payload);
        for (key, value) in &self.spec.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(session) = self.session_id.lock().await.as_ref() {
            builder = builder.header(SESSION_HEADER, session.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolHostError::Timeout {
                    server: self.name.clone(),
                    operation: "request".to_string(),
                }
            } else {
                self.transport(e.to_string())
            }
        })?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = response.status();
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| self.transport(e.to_string()))?;

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("error");
            return Err(self.transport(format!("HTTP {} {}: {}", status.as_u16(), reason, body)));
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        if is_sse {
            return Ok(protocol::parse_sse_messages(&body));
        }
        let value: Value = serde_json::from_str(&body).map_err(|source| ToolHostError::InvalidJson {
            server: self.name.clone(),
            source,
        })?;
        Ok(match value {
            Value::Array(batch) => batch,
            single => vec![single],
        })
    }
}

#[async_trait]
impl ToolHost for HttpToolHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolSpec>, ToolHostError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.request("tools/list", params, timeout).await?;
            let (page, next) = protocol::parse_tools(&self.name, &result)?;
            tools.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value, timeout: Duration) -> Result<Value, ToolHostError> {
        self.request("tools/call", protocol::call_params(name, arguments), timeout)
            .await
    }

    async fn close(&self) -> Result<(), ToolHostError> {
        let session = self.session_id.lock().await.take();
        if let Some(session) = session {
            // 会话终止失败不影响结果
            let _ = self
                .http
                .delete(&self.spec.url)
                .header(SESSION_HEADER, session)
                .send()
                .await;
        }
        Ok(())
    }
}
