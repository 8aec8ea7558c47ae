//! Capability-provider protocol client.
//!
//! Providers live out of process and speak JSON-RPC 2.0 over one of two
//! bindings: a spawned subprocess exchanging newline-delimited messages over
//! its standard streams, or a persistent server-pushed event stream with
//! requests POSTed out of band. Both correlate responses to requests by a
//! client-generated id and honor per-request cancellation.

pub mod remote;
pub mod sse;
pub mod stdio;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

pub use remote::RemoteCapability;
pub use sse::SseClient;
pub use stdio::StdioClient;
pub use types::{InvocationResult, RemoteCapabilityDef};

/// In-flight requests awaiting a correlated response.
pub(crate) type PendingMap = Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value>>>>>;

/// Contract both protocol bindings implement.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Establish the connection and run the initialize handshake.
    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    async fn is_connected(&self) -> bool;

    /// Discover capabilities, optionally narrowed to names containing
    /// `filter`.
    async fn list_capabilities(
        &self,
        filter: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RemoteCapabilityDef>>;

    async fn invoke(
        &self,
        name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult>;

    /// Tear the connection down. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// Route one decoded message to its pending request, if any. Server
/// notifications are logged and dropped.
pub(crate) async fn dispatch_response(message: &str, pending: &PendingMap) -> Result<()> {
    let response: types::RpcResponse = serde_json::from_str(message)
        .map_err(|e| Error::transport("decode", format!("invalid response frame: {e}")))?;

    if let Some(id) = response.id {
        let mut pending = pending.write().await;
        if let Some(tx) = pending.remove(&id) {
            let reply = match response.error {
                Some(err) => Err(Error::transport(
                    "response",
                    format!("provider error {}: {}", err.code, err.message),
                )),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
        }
        return Ok(());
    }

    if let Some(method) = &response.method {
        debug!(method = %method, "ignoring provider notification");
    }
    Ok(())
}

/// Fail every in-flight request with a connection-lost error.
pub(crate) async fn fail_pending(pending: &PendingMap, context: &str) {
    let mut pending = pending.write().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::transport("response", context.to_string())));
    }
}

pub(crate) fn apply_filter(
    defs: Vec<RemoteCapabilityDef>,
    filter: Option<&str>,
) -> Vec<RemoteCapabilityDef> {
    match filter {
        Some(needle) => defs
            .into_iter()
            .filter(|d| d.name.contains(needle))
            .collect(),
        None => defs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_routes_by_id() {
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.write().await.insert(4, tx);

        dispatch_response(r#"{"jsonrpc":"2.0","id":4,"result":{"ok":true}}"#, &pending)
            .await
            .unwrap();
        let value = rx.await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(pending.read().await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_surfaces_provider_errors() {
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.write().await.insert(9, tx);

        dispatch_response(
            r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32000,"message":"boom"}}"#,
            &pending,
        )
        .await
        .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn filter_narrows_by_substring() {
        let defs = vec![
            RemoteCapabilityDef {
                name: "browser_navigate".to_string(),
                description: None,
                input_schema: json!({}),
            },
            RemoteCapabilityDef {
                name: "fs_read".to_string(),
                description: None,
                input_schema: json!({}),
            },
        ];
        let filtered = apply_filter(defs, Some("browser"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "browser_navigate");
    }
}
