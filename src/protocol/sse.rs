//! Streaming protocol binding.
//!
//! Holds one long-lived server-pushed event stream per provider. The
//! stream's first `endpoint` event names the POST target for outbound
//! requests; `message` events carry JSON-RPC responses correlated by id.
//! A heartbeat ping re-validates liveness and a stream error triggers one
//! delayed reconnect before the connection is declared dead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};

use super::types::{
    CancelledParams, CapabilityListResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, InvocationResult, InvokeParams, RemoteCapabilityDef, RpcNotification,
    RpcRequest, PROTOCOL_VERSION,
};
use super::{apply_filter, dispatch_response, fail_pending, PendingMap, ProviderClient};

// ── frame parsing ──────────────────────────────────────────────────────────

/// One server-pushed event: `id:`/`event:`/`data:` lines ending at a blank
/// line. Missing `event` defaults to `message`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Frame {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental line-buffer state machine. Bytes accumulate until a blank
/// line closes a frame; partial frames stay buffered across chunks.
#[derive(Default)]
pub(crate) struct FrameParser {
    buffer: String,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every frame it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<Frame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some((end, len)) = find_frame_end(&self.buffer) {
            let raw: String = self.buffer.drain(..end + len).collect();
            if let Some(frame) = parse_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }
}

fn find_frame_end(buffer: &str) -> Option<(usize, usize)> {
    let lf = buffer.find("\n\n").map(|i| (i, 2));
    let crlf = buffer.find("\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

fn parse_frame(raw: &str) -> Option<Frame> {
    let mut id = None;
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "id" => id = Some(value.to_string()),
            "event" => event = Some(value.to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }

    if id.is_none() && event.is_none() && data_lines.is_empty() {
        return None;
    }
    Some(Frame {
        id,
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}

// ── client ─────────────────────────────────────────────────────────────────

/// Outbound request machinery shared with the background tasks.
struct SseCore {
    name: String,
    http: reqwest::Client,
    endpoint: RwLock<Option<reqwest::Url>>,
    pending: PendingMap,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl SseCore {
    async fn post(&self, body: String, method: &str) -> Result<()> {
        let endpoint = {
            let guard = self.endpoint.read().await;
            guard
                .clone()
                .ok_or_else(|| Error::transport(method, "no endpoint announced yet"))?
        };

        let response = self
            .http
            .post(endpoint)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::transport(method, e.to_string()))?;

        // The POST body is only a literal acknowledgement; the real response
        // arrives on the stream.
        if !response.status().is_success() {
            return Err(Error::transport(
                method,
                format!("endpoint returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<R> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&RpcRequest::new(id, method, params))
            .map_err(|e| Error::transport(method, e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        debug!(provider = %self.name, id, method, "posting request");
        if let Err(e) = self.post(json, method).await {
            self.pending.write().await.remove(&id);
            return Err(e);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.pending.write().await.remove(&id);
                self.notify_cancelled(id).await;
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
        let json = serde_json::to_string(&RpcNotification::new(method, params))
            .map_err(|e| Error::transport(method, e.to_string()))?;
        self.post(json, method).await
    }

    async fn notify_cancelled(&self, request_id: i64) {
        let params = CancelledParams {
            request_id,
            reason: None,
        };
        let _ = self
            .notify(
                "notifications/cancelled",
                serde_json::to_value(params).ok(),
            )
            .await;
    }
}

/// Streaming binding of the provider protocol.
pub struct SseClient {
    stream_url: reqwest::Url,
    core: Arc<SseCore>,
    connected: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    reconnect_delay: Duration,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl SseClient {
    pub fn new(name: impl Into<String>, stream_url: &str, config: &RuntimeConfig) -> Result<Self> {
        let name = name.into();
        let stream_url = reqwest::Url::parse(stream_url)
            .map_err(|e| Error::transport("connect", format!("bad stream url: {e}")))?;
        Ok(Self {
            stream_url,
            core: Arc::new(SseCore {
                name,
                http: reqwest::Client::new(),
                endpoint: RwLock::new(None),
                pending: Arc::new(RwLock::new(HashMap::new())),
                next_id: AtomicI64::new(1),
                request_timeout: config.request_timeout(),
            }),
            connected: Arc::new(AtomicBool::new(false)),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_delay: config.reconnect_delay(),
            shutdown: Mutex::new(None),
        })
    }

    /// Drive the event stream, retrying once after a delay on failure.
    async fn run_stream(
        stream_url: reqwest::Url,
        core: Arc<SseCore>,
        connected: Arc<AtomicBool>,
        reconnect_delay: Duration,
        mut endpoint_tx: Option<oneshot::Sender<()>>,
        shutdown: CancellationToken,
    ) {
        let mut attempts_left = 2usize;

        while attempts_left > 0 {
            attempts_left -= 1;
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = Self::read_stream(&stream_url, &core, &connected, &mut endpoint_tx, &shutdown) => r,
            };

            match outcome {
                Ok(()) => break,
                Err(e) if attempts_left > 0 => {
                    warn!(provider = %core.name, error = %e, "stream error, reconnecting once");
                    connected.store(false, Ordering::SeqCst);
                    tokio::time::sleep(reconnect_delay).await;
                }
                Err(e) => {
                    error!(provider = %core.name, error = %e, "stream lost");
                }
            }
        }

        connected.store(false, Ordering::SeqCst);
        fail_pending(&core.pending, "stream closed").await;
    }

    async fn read_stream(
        stream_url: &reqwest::Url,
        core: &Arc<SseCore>,
        connected: &Arc<AtomicBool>,
        endpoint_tx: &mut Option<oneshot::Sender<()>>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let response = core
            .http
            .get(stream_url.clone())
            .header("accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::transport("connect", e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::transport(
                "connect",
                format!("stream returned {}", response.status()),
            ));
        }

        let mut parser = FrameParser::new();
        let mut body = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                chunk = body.next() => chunk,
            };
            let bytes: Bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(Error::transport("receive", e.to_string())),
                None => return Err(Error::transport("receive", "stream ended")),
            };

            for frame in parser.push(&String::from_utf8_lossy(&bytes)) {
                match frame.event.as_str() {
                    "endpoint" => {
                        let endpoint = stream_url.join(frame.data.trim()).map_err(|e| {
                            Error::transport("connect", format!("bad endpoint: {e}"))
                        })?;
                        info!(provider = %core.name, endpoint = %endpoint, "endpoint announced");
                        *core.endpoint.write().await = Some(endpoint);
                        connected.store(true, Ordering::SeqCst);
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    "message" => {
                        if let Err(e) = dispatch_response(&frame.data, &core.pending).await {
                            error!(provider = %core.name, error = %e, "bad message frame");
                        }
                    }
                    other => debug!(provider = %core.name, event = other, "ignoring event"),
                }
            }
        }
    }

    fn spawn_heartbeat(&self, shutdown: CancellationToken) {
        let core = Arc::clone(&self.core);
        let connected = Arc::clone(&self.connected);
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !connected.load(Ordering::SeqCst) {
                    continue;
                }
                let cancel = CancellationToken::new();
                if let Err(e) = core.request::<Value>("ping", None, &cancel).await {
                    warn!(provider = %core.name, error = %e, "heartbeat failed");
                }
            }
        });
    }
}

#[async_trait]
impl ProviderClient for SseClient {
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        {
            let mut guard = self.shutdown.lock().await;
            if let Some(previous) = guard.replace(shutdown.clone()) {
                previous.cancel();
            }
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        tokio::spawn(Self::run_stream(
            self.stream_url.clone(),
            Arc::clone(&self.core),
            Arc::clone(&self.connected),
            self.reconnect_delay,
            Some(endpoint_tx),
            shutdown.clone(),
        ));

        // Wait for the endpoint announcement before the handshake.
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = tokio::time::timeout(self.core.request_timeout, endpoint_rx) => {
                outcome
                    .map_err(|_| Error::transport("connect", "no endpoint event before timeout"))?
                    .map_err(|_| Error::transport("connect", "stream closed before endpoint event"))?;
            }
        }

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        };
        let result: InitializeResult = self
            .core
            .request(
                "initialize",
                Some(
                    serde_json::to_value(params)
                        .map_err(|e| Error::transport("initialize", e.to_string()))?,
                ),
                cancel,
            )
            .await?;
        info!(
            provider = %self.core.name,
            protocol = %result.protocol_version,
            "provider initialized"
        );
        self.core.notify("notifications/initialized", None).await?;

        self.spawn_heartbeat(shutdown);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn list_capabilities(
        &self,
        filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteCapabilityDef>> {
        let result: CapabilityListResult = self.core.request("tools/list", None, cancel).await?;
        debug!(provider = %self.core.name, count = result.tools.len(), "capabilities listed");
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
            .core
            .request(
                "tools/call",
                Some(
                    serde_json::to_value(params)
                        .map_err(|e| Error::transport("tools/call", e.to_string()))?,
                ),
                cancel,
            )
            .await?;

        if result.is_error {
            return Err(Error::invocation(name, result.text()));
        }
        Ok(result)
    }

    async fn close(&self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.cancel();
            info!(provider = %self.core.name, "connection closed");
        }
        self.connected.store(false, Ordering::SeqCst);
        *self.core.endpoint.write().await = None;
        fail_pending(&self.core.pending, "connection closed").await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_chunks() {
        let mut parser = FrameParser::new();
        assert!(parser.push("event: endpoint\nda").is_empty());
        let frames = parser.push("ta: /rpc/42\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "endpoint");
        assert_eq!(frames[0].data, "/rpc/42");
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut parser = FrameParser::new();
        let frames = parser.push(
            "id: 1\nevent: message\ndata: {\"a\":1}\n\nid: 2\ndata: {\"b\":2}\n\n",
        );
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id.as_deref(), Some("1"));
        assert_eq!(frames[1].event, "message");
        assert_eq!(frames[1].data, "{\"b\":2}");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = FrameParser::new();
        let frames = parser.push("data: line one\ndata: line two\n\n");
        assert_eq!(frames[0].data, "line one\nline two");
    }

    #[test]
    fn comments_and_crlf_tolerated() {
        let mut parser = FrameParser::new();
        let frames = parser.push(": keepalive\r\nevent: message\r\ndata: x\r\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn crlf_terminated_frame_completes() {
        let mut parser = FrameParser::new();
        let frames = parser.push("event: message\r\ndata: y\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "y");
    }

    #[test]
    fn endpoint_resolves_relative_to_stream_url() {
        let base = reqwest::Url::parse("http://localhost:9292/sse").unwrap();
        let joined = base.join("/rpc/7").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:9292/rpc/7");
    }
}
