//! taskloom: execution core for an autonomous multi-agent task runner.
//!
//! A planning step (out of scope here) emits a declarative task graph as
//! structured markup. This crate takes it from there:
//!
//! - `plan` - the task graph data model and its round-trip markup codec,
//!   tolerant of incrementally streamed documents
//! - `compiler` - flat dependency-annotated agent list into a chain of
//!   sequential/parallel execution stages, with cycle repair
//! - `runtime` - the per-agent reason/act loop, capability dispatch,
//!   policy pipeline, circuit breaker, lifecycle events
//! - `capability` - the capability trait, table, and invocation records
//! - `protocol` - JSON-RPC client for out-of-process capability providers,
//!   over a spawned subprocess or a server-sent event stream
//! - `gateway` - the reasoning-engine seam: one request out, a folded
//!   step outcome back, with compression and backoff
//!
//! Consumers assemble an [`runtime::AgentRuntime`], register providers,
//! capabilities and policies, and hand it a parsed [`plan::Plan`].

pub mod capability;
pub mod compiler;
pub mod config;
pub mod error;
pub mod gateway;
pub mod plan;
pub mod protocol;
pub mod runtime;

pub use capability::{Capability, CapabilityDescriptor, CapabilityTable, InvocationOutput};
pub use compiler::{compile, StageNode};
pub use config::{CapabilityRefresh, RuntimeConfig};
pub use error::{Error, Result};
pub use gateway::{Gateway, ReasoningEngine, StepOutcome};
pub use plan::{AgentStatus, Plan, PlanAgent, PlanNode};
pub use protocol::{ProviderClient, SseClient, StdioClient};
pub use runtime::context::TaskContext;
pub use runtime::events::{EventSink, TaskEvent};
pub use runtime::policy::{ApprovalGate, FailureAction, InvocationPolicy, PolicyDecision};
pub use runtime::AgentRuntime;
