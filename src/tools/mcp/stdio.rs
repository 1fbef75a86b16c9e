//! 子进程工具宿主：按行分隔的 JSON-RPC 2.0（stdin 写请求，stdout 读响应）
//!
//! 后台 reader 任务按 id 将响应派发给等待中的 oneshot；进程退出时所有等待中的请求以 Terminated 结束。

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, warn};

use super::protocol;
use crate::tools::{ToolHost, ToolHostError, ToolSpec};

/// 子进程启动参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StdioSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value, ToolHostError>>>;

pub struct StdioToolHost {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    child: AsyncMutex<Option<Child>>,
    writer: AsyncMutex<Option<BufWriter<ChildStdin>>>,
    pending: AsyncMutex<Pending>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl StdioToolHost {
    /// 启动子进程并完成 initialize 握手
    pub async fn start(
        name: &str,
        spec: &StdioSpec,
        timeout: Duration,
    ) -> Result<Self, ToolHostError> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &spec.workdir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ToolHostError::Spawn {
            server: name.to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or_else(|| ToolHostError::Transport {
            server: name.to_string(),
            message: "failed to capture server stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolHostError::Transport {
            server: name.to_string(),
            message: "failed to capture server stdout".to_string(),
        })?;

        let inner = Arc::new(Inner {
            name: name.to_string(),
            child: AsyncMutex::new(Some(child)),
            writer: AsyncMutex::new(Some(BufWriter::new(stdin))),
            pending: AsyncMutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        });

        let reader = Arc::clone(&inner);
        tokio::spawn(async move { reader.reader_loop(stdout).await });

        let host = Self { inner };
        if let Err(err) = host.initialize(timeout).await {
            let _ = host.close().await;
            return Err(err);
        }
        tracing::info!(server = %name, command = %spec.command, "Tool host started");
        Ok(host)
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), ToolHostError> {
        self.inner
            .request("initialize", protocol::initialize_params(), timeout)
            .await?;
        self.inner
            .write(&protocol::notification("notifications/initialized", json!({})))
            .await
    }
}

impl Inner {
    async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ToolHostError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ToolHostError::Terminated {
                server: self.name.clone(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(err) = self.write(&protocol::request(id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ToolHostError::Terminated {
                server: self.name.clone(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ToolHostError::Timeout {
                    server: self.name.clone(),
                    operation: method.to_string(),
                })
            }
        }
    }

    async fn write(&self, payload: &Value) -> Result<(), ToolHostError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| ToolHostError::Terminated {
            server: self.name.clone(),
        })?;
        let mut line = payload.to_string();
        line.push('\n');
        let io = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        io.await.map_err(|e| ToolHostError::Transport {
            server: self.name.clone(),
            message: e.to_string(),
        })
    }

    async fn reader_loop(self: Arc<Self>, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(raw)) = lines.next_line().await {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => self.dispatch(value).await,
                Err(source) => {
                    debug!(server = %self.name, line = trimmed, %source, "skipping non-JSON line from tool host");
                }
            }
        }

        self.alive.store(false, Ordering::SeqCst);
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(ToolHostError::Terminated {
                server: self.name.clone(),
            }));
        }
    }

    async fn dispatch(&self, value: Value) {
        let id = value.get("id").cloned();
        let method = value.get("method").and_then(Value::as_str).map(String::from);
        match (id, method) {
            // 服务端请求：仅应答 ping，其余回 method not found
            (Some(id), Some(method)) => {
                let reply = if method == "ping" {
                    protocol::response(id, json!({}))
                } else {
                    warn!(server = %self.name, method = %method, "tool host sent unsupported request");
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": format!("client does not implement method '{method}'") }
                    })
                };
                if let Err(err) = self.write(&reply).await {
                    warn!(server = %self.name, %err, "failed to answer tool host request");
                }
            }
            (Some(id), None) => {
                let Some(key) = id.as_u64() else {
                    return;
                };
                let sender = self.pending.lock().await.remove(&key);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(protocol::into_result(&self.name, value));
                    }
                    None => debug!(server = %self.name, id = key, "response for unknown request"),
                }
            }
            (None, Some(method)) => {
                debug!(server = %self.name, method = %method, "notification from tool host");
            }
            (None, None) => {}
        }
    }
}

#[async_trait]
impl ToolHost for StdioToolHost {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolSpec>, ToolHostError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.inner.request("tools/list", params, timeout).await?;
            let (page, next) = protocol::parse_tools(&self.inner.name, &result)?;
            tools.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<Value, ToolHostError> {
        self.inner
            .request("tools/call", protocol::call_params(name, arguments), timeout)
            .await
    }

    async fn close(&self) -> Result<(), ToolHostError> {
        self.inner.alive.store(false, Ordering::SeqCst);
        self.inner.writer.lock().await.take();
        if let Some(mut child) = self.inner.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.inner.name, error = %e, "tool host already exited");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let spec = StdioSpec {
            command: "/definitely/not/a/binary".to_string(),
            ..Default::default()
        };
        match StdioToolHost::start("ghost", &spec, Duration::from_secs(1)).await {
            Err(ToolHostError::Spawn { server, .. }) => assert_eq!(server, "ghost"),
            Err(other) => panic!("Expected Spawn, got {other}"),
            Ok(_) => panic!("Expected Spawn error"),
        }
    }
}
