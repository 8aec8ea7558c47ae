//! Subprocess protocol binding.
//!
//! Spawns the provider as a child process and exchanges newline-delimited
//! JSON-RPC messages over its standard streams. A background receive loop
//! routes responses to their pending requests so concurrent callers never
//! race on the stream.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

use super::types::{
    CancelledParams, CapabilityListResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, InvocationResult, InvokeParams, RemoteCapabilityDef, RpcNotification,
    RpcRequest, PROTOCOL_VERSION,
};
use super::{apply_filter, dispatch_response, fail_pending, PendingMap, ProviderClient};

/// Raw line transport over the child's standard streams.
struct ChildTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl ChildTransport {
    async fn spawn(command: &str, args: &[String], env: &HashMap<String, String>) -> Result<Self> {
        info!(command = %command, ?args, "spawning capability provider");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::transport("connect", format!("command not found: {command}"))
            } else {
                Error::transport("connect", format!("failed to spawn {command}: {e}"))
            }
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::transport("connect", "child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transport("connect", "child has no stdout"))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }

    async fn send(&self, message: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::transport("send", e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::transport("send", e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::transport("send", e.to_string()))?;
        Ok(())
    }

    /// Next JSON line from the child, skipping stray non-JSON output.
    async fn receive(&self) -> Result<String> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            let bytes = stdout
                .read_line(&mut line)
                .await
                .map_err(|e| Error::transport("receive", e.to_string()))?;
            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => {
                        Err(Error::transport("receive", format!("provider exited: {status}")))
                    }
                    _ => Err(Error::transport("receive", "provider closed its stdout")),
                };
            }

            let line = line.trim();
            if line.starts_with('{') {
                return Ok(line.to_string());
            }
            if !line.is_empty() {
                debug!(line = %line, "skipping non-protocol output");
            }
        }
    }

    async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

struct Connection {
    transport: Arc<ChildTransport>,
    shutdown_tx: mpsc::Sender<()>,
}

/// Subprocess binding of the provider protocol.
pub struct StdioClient {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    request_timeout: Duration,
    next_id: AtomicI64,
    pending: PendingMap,
    connection: RwLock<Option<Connection>>,
}

impl StdioClient {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env,
            request_timeout: config.request_timeout(),
            next_id: AtomicI64::new(1),
            pending: Arc::new(RwLock::new(HashMap::new())),
            connection: RwLock::new(None),
        }
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let transport = {
            let guard = self.connection.read().await;
            let conn = guard
                .as_ref()
                .ok_or_else(|| Error::transport(method, "not connected"))?;
            Arc::clone(&conn.transport)
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| Error::transport(method, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        debug!(provider = %self.name, id, method, "sending request");
        if let Err(e) = transport.send(&json).await {
            self.pending.write().await.remove(&id);
            return Err(Error::transport(method, e.to_string()));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.write().await.remove(&id);
                self.notify_cancelled(&transport, id).await;
                Err(Error::Cancelled)
            }
            outcome = tokio::time::timeout(self.request_timeout, rx) => match outcome {
                Ok(Ok(Ok(value))) => serde_json::from_value(value)
                    .map_err(|e| Error::transport(method, e.to_string())),
                Ok(Ok(Err(e))) => Err(Error::transport(method, e.to_string())),
                Ok(Err(_)) => Err(Error::transport(method, "response channel dropped")),
                Err(_) => {
                    self.pending.write().await.remove(&id);
                    Err(Error::transport(
                        method,
                        format!("timed out after {:?}", self.request_timeout),
                    ))
                }
            },
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let guard = self.connection.read().await;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::transport(method, "not connected"))?;
        let json = serde_json::to_string(&RpcNotification::new(method, params))
            .map_err(|e| Error::transport(method, e.to_string()))?;
        conn.transport.send(&json).await
    }

    async fn notify_cancelled(&self, transport: &ChildTransport, request_id: i64) {
        let params = CancelledParams {
            request_id,
            reason: None,
        };
        if let Ok(json) = serde_json::to_string(&RpcNotification::new(
            "notifications/cancelled",
            serde_json::to_value(params).ok(),
        )) {
            let _ = transport.send(&json).await;
        }
    }
}

#[async_trait]
impl ProviderClient for StdioClient {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let transport = Arc::new(ChildTransport::spawn(&self.command, &self.args, &self.env).await?);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let recv_transport = Arc::clone(&transport);
        let recv_pending = Arc::clone(&self.pending);
        let recv_name = self.name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!(provider = %recv_name, "receive loop shutting down");
                        break;
                    }
                    result = recv_transport.receive() => match result {
                        Ok(message) => {
                            if let Err(e) = dispatch_response(&message, &recv_pending).await {
                                error!(provider = %recv_name, error = %e, "bad message");
                            }
                        }
                        Err(e) => {
                            error!(provider = %recv_name, error = %e, "connection lost");
                            fail_pending(&recv_pending, "connection lost").await;
                            break;
                        }
                    }
                }
            }
        });

        *self.connection.write().await = Some(Connection {
            transport,
            shutdown_tx,
        });

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        };
        let result: InitializeResult = self
            .request(
                "initialize",
                Some(serde_json::to_value(params).map_err(|e| {
                    Error::transport("initialize", e.to_string())
                })?),
                cancel,
            )
            .await?;
        info!(
            provider = %self.name,
            protocol = %result.protocol_version,
            "provider initialized"
        );

        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        let guard = self.connection.read().await;
        match guard.as_ref() {
            Some(conn) => conn.transport.is_alive().await,
            None => false,
        }
    }

    async fn list_capabilities(
        &self,
        filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteCapabilityDef>> {
        let result: CapabilityListResult = self.request("tools/list", None, cancel).await?;
        debug!(provider = %self.name, count = result.tools.len(), "capabilities listed");
        Ok(apply_filter(result.tools, filter))
    }

    async fn invoke(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult> {
        let params = InvokeParams {
            name: name.to_string(),
            arguments: if args.is_null() { None } else { Some(args) },
        };
        let result: InvocationResult = self
            .request(
                "tools/call",
                Some(serde_json::to_value(params).map_err(|e| {
                    Error::transport("tools/call", e.to_string())
                })?),
                cancel,
            )
            .await?;

        if result.is_error {
            return Err(Error::invocation(name, result.text()));
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        if let Some(conn) = self.connection.write().await.take() {
            let _ = conn.shutdown_tx.try_send(());
            info!(provider = %self.name, "connection closed");
        }
        fail_pending(&self.pending, "connection closed").await;
        Ok(())
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.connection.try_write() {
            if let Some(conn) = guard.take() {
                let _ = conn.shutdown_tx.try_send(());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    // Echoes a fixed result for every request id it sees; ignores
    // notifications (no id). Enough to satisfy the handshake and discovery.
    const RESPONDER: &str = r#"while IFS= read -r line; do
        id=$(printf %s "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
        if [ -n "$id" ]; then
            printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","tools":[{"name":"echo","inputSchema":{"type":"object"}}]}}\n' "$id"
        fi
    done"#;

    // Keeps the responder on disk so the spawn path covers a real script
    // file; the TempDir must outlive the client.
    fn test_client() -> (StdioClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("responder.sh");
        std::fs::write(&script, RESPONDER).unwrap();
        let client = StdioClient::new(
            "test",
            "sh",
            vec![script.to_string_lossy().into_owned()],
            HashMap::new(),
            &RuntimeConfig::default(),
        );
        (client, dir)
    }

    #[tokio::test]
    async fn handshake_and_discovery() {
        let (client, _dir) = test_client();
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        assert!(client.is_connected().await);

        let caps = client.list_capabilities(None, &cancel).await.unwrap();
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, "echo");

        client.close().await.unwrap();
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn filter_applies_to_discovery() {
        let (client, _dir) = test_client();
        let cancel = CancellationToken::new();
        client.connect(&cancel).await.unwrap();

        let caps = client
            .list_capabilities(Some("nomatch"), &cancel)
            .await
            .unwrap();
        assert!(caps.is_empty());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn request_without_connection_fails() {
        let (client, _dir) = test_client();
        let cancel = CancellationToken::new();
        let err = client
            .invoke("echo", serde_json::json!({}), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[tokio::test]
    async fn cancelled_request_returns_cancelled() {
        let (client, _dir) = test_client();
        let cancel = CancellationToken::new();
        client.connect(&cancel).await.unwrap();

        let call_cancel = cancel.child_token();
        call_cancel.cancel();
        // The responder only answers requests it has read; a pre-cancelled
        // token must win the race regardless.
        let err = client
            .invoke("echo", serde_json::json!({}), &call_cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled() || matches!(err, Error::Transport { .. }));
        client.close().await.unwrap();
    }
}
