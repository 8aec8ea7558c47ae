//! Error taxonomy for the execution core.
//!
//! Graph and parse errors propagate synchronously to the caller. Transport
//! and invocation errors are contained at the invocation layer (policy
//! pipeline, circuit breaker) and only unwind an agent when escalated.
//! Cancellation is a distinguished kind and is never swallowed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The plan contained no runnable agent after filtering and repair.
    #[error("no executable agent in plan")]
    NoExecutableAgent,

    /// The plan document was structurally invalid on a final parse.
    #[error("plan parse error: {0}")]
    PlanParse(String),

    /// A positional node id did not resolve.
    #[error("no plan node at agent {agent}, node {node}")]
    NodeNotFound { agent: usize, node: usize },

    /// A protocol-level failure, naming the method that failed.
    #[error("transport error in '{method}': {message}")]
    Transport { method: String, message: String },

    /// The reasoning engine failed fatally (content filter, exhausted
    /// retries, malformed stream).
    #[error("reasoning engine error: {0}")]
    Reasoning(String),

    /// A capability invocation failed, naming the capability.
    #[error("capability '{name}' failed: {message}")]
    Invocation { name: String, message: String },

    /// An invocation was blocked by policy.
    #[error("capability '{name}' blocked by policy: {reason}")]
    Blocked { name: String, reason: String },

    /// The task-wide or per-call cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn transport(method: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            method: method.into(),
            message: message.to_string(),
        }
    }

    pub fn invocation(name: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Invocation {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// True for the distinguished cancellation kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
