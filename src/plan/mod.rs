//! Plan data model.
//!
//! A `Plan` is the declarative multi-agent task description produced by the
//! planning step: an ordered list of `PlanAgent`s, each carrying dependency
//! edges onto other agents and a list of `PlanNode` work items. The plan is
//! both the planner's output and the re-serialized execution snapshot, so it
//! keeps the markup it was parsed from and can always be re-serialized
//! byte-for-byte (see `codec`).

pub mod codec;
pub mod markup;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dependency id designating the virtual root: agents depending solely on it
/// are entry nodes even when nothing else has zero dependencies.
pub const VIRTUAL_ROOT_ID: &str = "root";

/// Lifecycle of a single plan agent. `Done` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Init,
    Running,
    Done,
    Error,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One work item inside an agent's task breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlanNode {
    /// A plain step, optionally reading/writing named variables.
    Step {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        input: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    /// Iterate the steps once per element of a named collection variable.
    ForEach { items: String, steps: Vec<PlanNode> },
    /// Event-triggered steps, optionally re-armed after each firing.
    Watch {
        event: String,
        #[serde(rename = "loop")]
        looping: bool,
        description: String,
        triggers: Vec<PlanNode>,
    },
}

/// Positional address of a `PlanNode`: agent ordinal plus node ordinal in
/// serialized order. Re-derived from position on every parse, which is why
/// the codec must be round-trip stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub agent: usize,
    pub node: usize,
}

/// One capability-provider's sub-task within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanAgent {
    /// `"{plan_id}-{ordinal}"`.
    pub id: String,
    /// Capability-provider name (which provider's tools this agent drives).
    pub provider: String,
    /// Ids of agents that must reach a terminal state first.
    pub depends_on: Vec<String>,
    /// Task text given to the reasoning engine.
    pub task: String,
    pub nodes: Vec<PlanNode>,
    pub status: AgentStatus,
    /// Set by the compiler when the agent lands in a `Parallel` stage.
    pub parallel: bool,
    /// Raw markup fragment this agent was parsed from.
    pub markup: String,
    /// Populated when the agent ends in `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// The planner's rationale (`<thought>` in the markup).
    pub rationale: String,
    pub agents: Vec<PlanAgent>,
    /// Cached serialized form; refreshed by `codec::serialize`.
    pub markup: String,
}

impl Plan {
    /// Resolve a positional id to its node without re-parsing the document.
    pub fn node(&self, id: NodeId) -> Result<&PlanNode> {
        self.agents
            .get(id.agent)
            .and_then(|a| a.nodes.get(id.node))
            .ok_or(Error::NodeNotFound {
                agent: id.agent,
                node: id.node,
            })
    }

    pub fn agent(&self, id: &str) -> Option<&PlanAgent> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn agent_mut(&mut self, id: &str) -> Option<&mut PlanAgent> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    /// Record a status transition. Terminal errors keep their cause.
    pub fn set_status(&mut self, agent_id: &str, status: AgentStatus, error: Option<String>) {
        if let Some(agent) = self.agent_mut(agent_id) {
            agent.status = status;
            if error.is_some() {
                agent.error = error;
            }
        }
    }
}
