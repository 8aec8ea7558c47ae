//! Task-wide and per-agent execution state.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::capability::{InvocationContext, InvocationRecord};
use crate::gateway::types::{ModelMessage, Usage};

/// State shared by every agent in one task: the variable store (concurrent,
/// last-write-wins) and the task-wide cancellation token.
pub struct TaskContext {
    pub variables: Arc<DashMap<String, Value>>,
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            variables: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Disposable per-call token: cancelling it aborts one call, while the
    /// task token firing cancels every outstanding child.
    pub fn call_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-agent state, alive from agent start to its terminal status. Each
/// agent owns its transcript; nothing here is shared with siblings.
pub struct AgentContext {
    pub agent_id: String,
    pub task: Arc<TaskContext>,
    pub transcript: Vec<ModelMessage>,
    /// Circuit breaker counter. Reset by any invocation success.
    pub consecutive_errors: usize,
    /// Names of capabilities this agent has invoked, kept across discovery
    /// refreshes.
    pub used_capabilities: HashSet<String>,
    pub records: Vec<InvocationRecord>,
    pub usage: Usage,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, task: Arc<TaskContext>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task,
            transcript: Vec::new(),
            consecutive_errors: 0,
            used_capabilities: HashSet::new(),
            records: Vec::new(),
            usage: Usage::default(),
        }
    }

    /// Context for one invocation, carrying a fresh per-call token.
    pub fn invocation_context(&self) -> InvocationContext {
        InvocationContext {
            agent_id: self.agent_id.clone(),
            variables: Arc::clone(&self.task.variables),
            cancel: self.task.call_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_token_observes_task_token() {
        let task = TaskContext::new();
        let call = task.call_token();
        assert!(!call.is_cancelled());
        task.cancel.cancel();
        assert!(call.is_cancelled());
    }

    #[test]
    fn call_token_cancel_leaves_task_running() {
        let task = TaskContext::new();
        let call = task.call_token();
        call.cancel();
        assert!(!task.cancel.is_cancelled());
    }

    #[test]
    fn variable_store_is_shared_across_agents() {
        let task = Arc::new(TaskContext::new());
        let a = AgentContext::new("t-0", Arc::clone(&task));
        let b = AgentContext::new("t-1", Arc::clone(&task));
        a.task.variables.insert("pages".to_string(), json!([1, 2]));
        assert_eq!(
            b.task.variables.get("pages").map(|v| v.clone()),
            Some(json!([1, 2]))
        );
    }
}
