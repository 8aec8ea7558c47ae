//! Capability-provider wire types (JSON-RPC 2.0).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityDescriptor;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC request.
#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no response expected).
#[derive(Debug, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC response or server notification.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "jsonrpc")]
    pub _jsonrpc: String,
    pub id: Option<i64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    /// Set on server-originated notifications.
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub _params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, rename = "data")]
    pub _data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

#[derive(Debug, Default, Serialize)]
pub struct ClientCapabilities {}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// `tools/list` response.
#[derive(Debug, Deserialize)]
pub struct CapabilityListResult {
    pub tools: Vec<RemoteCapabilityDef>,
}

/// One provider-described capability.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteCapabilityDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl From<RemoteCapabilityDef> for CapabilityDescriptor {
    fn from(def: RemoteCapabilityDef) -> Self {
        Self {
            name: def.name,
            description: def.description.unwrap_or_default(),
            input_schema: def.input_schema,
        }
    }
}

/// `tools/call` params.
#[derive(Debug, Serialize)]
pub struct InvokeParams {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// `tools/call` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResult {
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub is_error: bool,
}

impl InvocationResult {
    /// Flatten the content blocks to displayable text.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for (idx, block) in self.content.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            out.push_str(&block.to_string());
        }
        out
    }
}

/// Content blocks carried in an invocation result.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default)]
        text: Option<String>,
    },
}

impl std::fmt::Display for ContentBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentBlock::Text { text } => write!(f, "{}", text),
            ContentBlock::Image { mime_type, .. } => write!(f, "[image: {}]", mime_type),
            ContentBlock::Resource { uri, text } => match text {
                Some(t) => write!(f, "{}\n{}", uri, t),
                None => write!(f, "{}", uri),
            },
        }
    }
}

/// `notifications/cancelled` params.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_without_null_params() {
        let req = RpcRequest::new(7, "ping", None);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert!(value.get("params").is_none());
    }

    #[test]
    fn invocation_result_flattens_blocks() {
        let result: InvocationResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": "...", "mimeType": "image/png"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.text(), "hello\n[image: image/png]");
        assert!(!result.is_error);
    }

    #[test]
    fn error_response_parses() {
        let resp: RpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert_eq!(resp.id, Some(3));
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
    }
}
