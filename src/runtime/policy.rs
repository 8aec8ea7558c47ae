//! Policy pipeline around capability invocation.
//!
//! Policies intercept three points of an invocation: before it runs
//! (allow/modify/block/skip/escalate), when it fails (retry/skip/abort/
//! escalate/continue), and after it succeeds (observational). Escalation
//! routes through an `ApprovalGate` when one is installed; without a gate an
//! escalation is denied.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::capability::{InvocationContext, InvocationOutput};
use crate::error::Error;

/// Pre-invocation verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// Proceed, optionally with rewritten arguments.
    Allow { modified_args: Option<Value> },
    /// Refuse terminally; the capability never runs.
    Block { reason: String },
    /// Do not run the capability; report a silent synthetic success.
    Skip { output: Option<String> },
    /// Route to the approval gate before proceeding.
    Escalate { prompt: String },
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self::Allow {
            modified_args: None,
        }
    }
}

/// What to do with a failed invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Re-run, bounded by `max_attempts` total tries with backoff between.
    Retry { max_attempts: usize },
    /// Swallow the failure and report a synthetic success.
    Skip { output: Option<String> },
    /// Propagate the error, aborting the agent.
    Abort,
    /// Ask the approval gate whether to try again.
    Escalate { prompt: String },
    /// Record the failure as an error-flagged result and move on.
    Continue,
}

#[async_trait]
pub trait InvocationPolicy: Send + Sync {
    fn name(&self) -> &str;

    async fn before_invoke(
        &self,
        _capability: &str,
        _args: &Value,
        _ctx: &InvocationContext,
    ) -> PolicyDecision {
        PolicyDecision::allow()
    }

    async fn on_failure(
        &self,
        _capability: &str,
        _args: &Value,
        _error: &Error,
        _ctx: &InvocationContext,
    ) -> FailureAction {
        FailureAction::Continue
    }

    /// Observational; runs on success only.
    async fn after_invoke(
        &self,
        _capability: &str,
        _args: &Value,
        _output: &InvocationOutput,
        _duration: Duration,
    ) {
    }
}

/// Human-approval route for escalated decisions.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn approve(&self, agent_id: &str, capability: &str, prompt: &str, args: &Value) -> bool;
}

// ── built-in policies ──────────────────────────────────────────────────────

/// Blocks a fixed set of capability names outright.
pub struct BlocklistPolicy {
    blocked: HashSet<String>,
}

impl BlocklistPolicy {
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            blocked: names.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl InvocationPolicy for BlocklistPolicy {
    fn name(&self) -> &str {
        "blocklist"
    }

    async fn before_invoke(
        &self,
        capability: &str,
        _args: &Value,
        _ctx: &InvocationContext,
    ) -> PolicyDecision {
        if self.blocked.contains(capability) {
            return PolicyDecision::Block {
                reason: format!("capability '{capability}' is blocked by policy"),
            };
        }
        PolicyDecision::allow()
    }
}

/// Logs every completed invocation with timing.
#[derive(Default)]
pub struct LoggingPolicy;

impl LoggingPolicy {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InvocationPolicy for LoggingPolicy {
    fn name(&self) -> &str {
        "logging"
    }

    async fn after_invoke(
        &self,
        capability: &str,
        _args: &Value,
        output: &InvocationOutput,
        duration: Duration,
    ) {
        info!(
            capability,
            duration_ms = duration.as_millis() as u64,
            is_error = output.is_error,
            output_len = output.output.len(),
            "invocation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::TaskContext;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx() -> InvocationContext {
        let task = Arc::new(TaskContext::new());
        crate::runtime::context::AgentContext::new("t-0", task).invocation_context()
    }

    #[tokio::test]
    async fn blocklist_blocks_named_capability() {
        let policy = BlocklistPolicy::new(["shell"]);
        let decision = policy.before_invoke("shell", &json!({}), &ctx()).await;
        assert!(matches!(decision, PolicyDecision::Block { .. }));

        let decision = policy.before_invoke("read", &json!({}), &ctx()).await;
        assert_eq!(decision, PolicyDecision::allow());
    }

    #[tokio::test]
    async fn default_failure_action_is_continue() {
        let policy = LoggingPolicy::new();
        let action = policy
            .on_failure(
                "read",
                &json!({}),
                &Error::invocation("read", "boom"),
                &ctx(),
            )
            .await;
        assert_eq!(action, FailureAction::Continue);
    }
}
