//! Stream control client (component L, §4.L): the outbound
//! half of the control path this crate keeps partially in scope. A stream's
//! `set_*` operations (§4.E) reach an external `controlscript` process
//! through this module rather than through the (out of scope) inbound
//! JSON-RPC/Web UI server.
//!
//! Grounded in `original_source/server/streamreader/stream_control.{hpp,cpp}`:
//! a script is spawned once per stream, newline-delimited JSON-RPC 2.0
//! objects flow over its stdin/stdout, and stderr lines are logged rather
//! than parsed.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::{SnapError, SnapResult};
use crate::pending::PendingRequests;
use crate::protocol_constants::CONTROL_REQUEST_TIMEOUT_MS;

/// A JSON-RPC 2.0 request sent to a control script.
#[derive(Debug, Clone)]
pub struct JsonRpcRequest {
    pub method: String,
    pub params: Value,
}

impl JsonRpcRequest {
    fn to_json(&self, id: u16) -> Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": self.method,
            "params": self.params,
        })
    }
}

/// A JSON-RPC 2.0 response or notification read back from a control script.
#[derive(Debug, Clone)]
enum JsonRpcInbound {
    Response { id: u64, result: Value },
    Error { id: u64, error: Value },
    Notification { method: String, params: Value },
}

fn parse_inbound(line: &str) -> Option<JsonRpcInbound> {
    let v: Value = serde_json::from_str(line).ok()?;
    if let Some(id) = v.get("id").and_then(Value::as_u64) {
        if let Some(result) = v.get("result") {
            return Some(JsonRpcInbound::Response { id, result: result.clone() });
        }
        if let Some(error) = v.get("error") {
            return Some(JsonRpcInbound::Error { id, error: error.clone() });
        }
        return None;
    }
    let method = v.get("method").and_then(Value::as_str)?.to_string();
    let params = v.get("params").cloned().unwrap_or(Value::Null);
    Some(JsonRpcInbound::Notification { method, params })
}

/// Capability trait a stream uses to issue control commands and receive
/// out-of-band notifications (property pushes) from its control channel.
#[async_trait]
pub trait StreamControl: Send + Sync {
    /// Starts the control channel for `stream_id`, handing it the server
    /// settings blob it announces to the plugin on startup.
    async fn start(&self, stream_id: &str, server_settings: &Value) -> SnapResult<()>;

    /// Issues a command and awaits its correlated response.
    async fn command(&self, request: JsonRpcRequest) -> SnapResult<Value>;
}

/// Always denies every command. Used when a stream's URI carries no
/// `controlscript` key.
pub struct NullStreamControl;

#[async_trait]
impl StreamControl for NullStreamControl {
    async fn start(&self, _stream_id: &str, _server_settings: &Value) -> SnapResult<()> {
        Ok(())
    }

    async fn command(&self, _request: JsonRpcRequest) -> SnapResult<Value> {
        Err(SnapError::CapabilityDenied("stream has no controlscript configured".into()))
    }
}

struct Shared {
    stdin: Mutex<tokio::process::ChildStdin>,
    pending: Mutex<PendingRequests<Result<Value, Value>>>,
    _child: Mutex<Child>,
}

/// Spawns `controlscript` as a child process and communicates over its
/// stdio. Pending requests are correlated the same way a session correlates
/// wire-protocol requests (§4.F), reusing [`PendingRequests`] generically.
#[derive(Clone)]
pub struct ScriptStreamControl {
    shared: Arc<Shared>,
}

impl ScriptStreamControl {
    /// Spawns `script params...` and starts its stdout/stderr pump tasks.
    /// Notifications pushed by the plugin are delivered on the returned
    /// receiver; the owning [`crate::stream::Stream`] subscribes to it.
    pub fn spawn(script: &str, params: &str) -> SnapResult<(Self, mpsc::Receiver<(String, Value)>)> {
        let args: Vec<&str> = params.split_whitespace().filter(|s| !s.is_empty()).collect();
        let mut child = Command::new(script)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SnapError::Io(format!("failed to spawn controlscript '{script}': {e}")))?;

        let stdin = child.stdin.take().expect("stdin piped");
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let shared = Arc::new(Shared {
            stdin: Mutex::new(stdin),
            pending: Mutex::new(PendingRequests::new()),
            _child: Mutex::new(child),
        });
        let control = Self { shared };

        let (notif_tx, notif_rx) = mpsc::channel(32);
        let shared_for_stdout = control.shared.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_inbound(&line) {
                    Some(JsonRpcInbound::Response { id, result }) => {
                        shared_for_stdout.pending.lock().await.complete(id as u16, Ok(result));
                    }
                    Some(JsonRpcInbound::Error { id, error }) => {
                        shared_for_stdout.pending.lock().await.complete(id as u16, Err(error));
                    }
                    Some(JsonRpcInbound::Notification { method, params }) => {
                        let _ = notif_tx.send((method, params)).await;
                    }
                    None => log::debug!("controlscript stdout: unparsable line '{line}'"),
                }
            }
        });

        let script_name = script.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[{script_name}] {line}");
            }
        });

        Ok((control, notif_rx))
    }

    async fn write_line(&self, value: &Value) -> SnapResult<()> {
        let mut stdin = self.shared.stdin.lock().await;
        stdin
            .write_all(format!("{value}\n").as_bytes())
            .await
            .map_err(|e| SnapError::Io(format!("controlscript stdin write failed: {e}")))
    }
}

#[async_trait]
impl StreamControl for ScriptStreamControl {
    async fn start(&self, stream_id: &str, server_settings: &Value) -> SnapResult<()> {
        let (id, _fut) = {
            let mut pending = self.shared.pending.lock().await;
            pending.register(Duration::from_millis(CONTROL_REQUEST_TIMEOUT_MS))
        };
        let request = JsonRpcRequest {
            method: "Plugin.Stream.Start".into(),
            params: serde_json::json!({ "streamId": stream_id, "serverSettings": server_settings }),
        };
        self.write_line(&request.to_json(id)).await
    }

    async fn command(&self, request: JsonRpcRequest) -> SnapResult<Value> {
        let (id, fut) = {
            let mut pending = self.shared.pending.lock().await;
            pending.register(Duration::from_millis(CONTROL_REQUEST_TIMEOUT_MS))
        };
        self.write_line(&request.to_json(id)).await?;
        match fut.await.into_result()? {
            Ok(result) => Ok(result),
            Err(error) => Err(SnapError::CapabilityDenied(error.to_string())),
        }
    }
}
