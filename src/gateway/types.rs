//! Reasoning-engine exchange types.
//!
//! These are the gateway's wire shapes, not domain types: a transcript of
//! `ModelMessage`s goes out, a stream of `StreamPart`s comes back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::CapabilityDescriptor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        output: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<Content>,
}

impl ModelMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![Content::Text { text: text.into() }],
        }
    }

    pub fn assistant(content: Vec<Content>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, output: Value, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![Content::ToolResult {
                tool_use_id: tool_use_id.into(),
                output,
                is_error: is_error.then_some(true),
            }],
        }
    }
}

/// Rough transcript size in characters, used against the compression
/// threshold. Exact token counts live on the engine side.
pub fn estimate_chars(messages: &[ModelMessage]) -> usize {
    messages
        .iter()
        .flat_map(|m| m.content.iter())
        .map(|c| match c {
            Content::Text { text } => text.len(),
            Content::ToolUse { input, .. } => input.to_string().len(),
            Content::ToolResult { output, .. } => output.to_string().len(),
        })
        .sum()
}

/// A finalized capability request from the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// How the engine should treat the capability list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Required,
    Tool { name: String },
}

/// One "generate next step" request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub messages: Vec<ModelMessage>,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub tool_choice: Option<ToolChoice>,
}

/// Streamed partial events from the engine, in arrival order.
#[derive(Debug, Clone)]
pub enum StreamPart {
    TextDelta { delta: String },
    ToolCallStart { id: String, name: String },
    ToolArgsDelta { id: String, delta: String },
    ToolCallComplete { tool_call: ToolCall },
    Usage { usage: Usage },
    Finish { reason: FinishReason },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn estimate_counts_all_content_kinds() {
        let messages = vec![
            ModelMessage::user("hello"),
            ModelMessage::assistant(vec![Content::ToolUse {
                id: "c1".to_string(),
                name: "read".to_string(),
                input: json!({"path": "x"}),
            }]),
            ModelMessage::tool_result("c1", json!("ok"), false),
        ];
        assert!(estimate_chars(&messages) > "hello".len());
    }
}
