//! ToolClient (component H) — a newline-delimited JSON-RPC client to a
//! long-lived tool-execution subprocess (spec.md §6).
//!
//! The subprocess lifecycle (spawn, respawn on crash, consecutive-failure
//! tracking) is grounded on the teacher's `CircuitBreakerRegistry`
//! (`upstream/circuit_breaker.rs`): a simple state counter rather than a
//! full open/half-open state machine, since there is exactly one
//! downstream process rather than a cluster of nodes. The writer/reader
//! task split and `oneshot`-per-call correlation are new code — the
//! teacher only ever speaks HTTP to upstreams, never owns a child process.

use crate::error::CoreError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Consecutive subprocess failures before a respawn is attempted on the
/// next call (mirrors the teacher's `consecutive_failures` threshold).
const RESPAWN_FAILURE_THRESHOLD: u32 = 3;

struct Inner {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    waiters: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>>,
    reader_task: tokio::task::JoinHandle<()>,
}

pub struct ToolClient {
    command: String,
    args: Vec<String>,
    call_timeout: Duration,
    next_id: AtomicU64,
    consecutive_failures: AtomicU32,
    inner: Mutex<Option<Inner>>,
}

impl ToolClient {
    pub fn new(command: String, args: Vec<String>, call_timeout_ms: u64) -> Self {
        Self {
            command,
            args,
            call_timeout: Duration::from_millis(call_timeout_ms),
            next_id: AtomicU64::new(1),
            consecutive_failures: AtomicU32::new(0),
            inner: Mutex::new(None),
        }
    }

    fn spawn_inner(&self) -> Result<Inner, CoreError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::transient(format!("failed to spawn tool process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoreError::fatal("tool process has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::fatal("tool process has no stdout"))?;

        let waiters: Arc<DashMap<u64, oneshot::Sender<RpcResponse>>> = Arc::new(DashMap::new());
        let waiters_for_reader = waiters.clone();

        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<RpcResponse>(&line) {
                            Ok(response) => {
                                if let Some((_, sender)) = waiters_for_reader.remove(&response.id) {
                                    let _ = sender.send(response);
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "toolclient: malformed response line");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("toolclient: subprocess closed stdout");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "toolclient: read error");
                        break;
                    }
                }
            }
        });

        Ok(Inner {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            waiters,
            reader_task,
        })
    }

    fn ensure_spawned(&self) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.spawn_inner()?);
        Ok(())
    }

    fn respawn(&self) -> Result<(), CoreError> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(old) = guard.take() {
            old.reader_task.abort();
            let _ = old.child.lock().unwrap().start_kill();
        }
        *guard = Some(self.spawn_inner()?);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        Ok(())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, CoreError> {
        if self.consecutive_failures.load(Ordering::Relaxed) >= RESPAWN_FAILURE_THRESHOLD {
            tracing::warn!(method, "toolclient: respawning after repeated failures");
            self.respawn()?;
        } else {
            self.ensure_spawned()?;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| CoreError::fatal(format!("failed to encode request: {e}")))?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let guard = self.inner.lock().unwrap();
            let inner = guard.as_ref().expect("spawned above");
            inner.waiters.insert(id, tx);
            let mut stdin = inner.stdin.lock().unwrap();
            // write_all on a std Mutex-guarded async handle: we hold the
            // lock only across the synchronous buffer copy + OS write call
            // chain below, not across an await point.
            let write_result = futures_write_line(&mut stdin, &line);
            if let Err(e) = write_result {
                inner.waiters.remove(&id);
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                return Err(CoreError::transient(format!("write to tool process failed: {e}")));
            }
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(response)) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                match response.error {
                    Some(err) => Err(CoreError::admission(format!(
                        "tool error {}: {}",
                        err.code, err.message
                    ))),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                }
            }
            Ok(Err(_)) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                Err(CoreError::transient("tool process dropped the response channel"))
            }
            Err(_) => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(inner) = self.inner.lock().unwrap().as_ref() {
                    inner.waiters.remove(&id);
                }
                Err(CoreError::transient("tool call timed out"))
            }
        }
    }

    pub async fn initialize(&self) -> Result<Value, CoreError> {
        self.call("initialize", serde_json::json!({})).await
    }

    pub async fn list_tools(&self) -> Result<Value, CoreError> {
        self.call("tools/list", serde_json::json!({})).await
    }

    pub async fn invoke(&self, tool: &str, arguments: Value) -> Result<Value, CoreError> {
        let start = std::time::Instant::now();
        let result = self
            .call(
                "tools/call",
                serde_json::json!({ "name": tool, "arguments": arguments }),
            )
            .await;
        metrics::histogram!("creditgate_tool_call_duration_seconds")
            .record(start.elapsed().as_secs_f64());
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("creditgate_tool_calls_total", "outcome" => outcome).increment(1);
        result
    }

    pub fn destroy(&self) {
        if let Some(inner) = self.inner.lock().unwrap().take() {
            inner.reader_task.abort();
            let _ = inner.child.lock().unwrap().start_kill();
        }
    }
}

/// Write one line to the subprocess's stdin without holding the `Mutex`
/// guard across an `.await` point: `ChildStdin::try_write` is
/// synchronous (backed by the OS pipe's non-blocking fd), which is
/// sufficient for request lines that fit the pipe buffer.
fn futures_write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    let bytes = line.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        match stdin.try_write(&bytes[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invoke_against_cat_echoes_nothing_but_does_not_panic() {
        // `cat` is not a JSON-RPC server, so this call will time out; the
        // point of this test is that spawn/write/timeout all complete
        // without panicking, exercising the full call path.
        let client = ToolClient::new("cat".to_string(), vec![], 50);
        let result = client.invoke("noop", serde_json::json!({})).await;
        assert!(result.is_err());
        client.destroy();
    }
}
