//! Capability interface and per-agent capability table.
//!
//! A capability is a named, schema-described operation an agent can invoke.
//! Dispatch is name-keyed and polymorphic: static capabilities registered at
//! construction and capabilities discovered from a provider share one table.

pub mod record;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use record::{InvocationRecord, StageOutcome};

/// Name, human description and JSON input schema of one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// What an invocation produced. `is_error` marks a failure the loop records
/// in the transcript rather than propagating.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutput {
    pub output: String,
    pub is_error: bool,
}

impl InvocationOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: false,
        }
    }

    pub fn error(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            is_error: true,
        }
    }
}

/// Ambient state handed to every invocation: the owning agent's id, the
/// task-wide variable store (last-write-wins, safe for concurrent access)
/// and the cancellation token for this specific call.
#[derive(Clone)]
pub struct InvocationContext {
    pub agent_id: String,
    pub variables: Arc<DashMap<String, Value>>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;

    /// Whether this capability may run concurrently with others in the same
    /// batch. Defaults to sequential.
    fn supports_parallel(&self) -> bool {
        false
    }

    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> InvocationOutput;
}

/// Name-keyed capability table for one agent.
///
/// Static entries are permanent. Dynamic entries come from provider
/// discovery and may be refreshed; a refresh keeps dynamic entries the agent
/// has already invoked so the working set does not churn under it.
#[derive(Default)]
pub struct CapabilityTable {
    entries: HashMap<String, Arc<dyn Capability>>,
    order: Vec<String>,
    dynamic: HashSet<String>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static capability. First registration of a name wins.
    pub fn register(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.descriptor().name;
        if self.entries.contains_key(&name) {
            warn!(capability = %name, "duplicate capability name, keeping existing");
            return;
        }
        self.order.push(name.clone());
        self.entries.insert(name, capability);
    }

    /// Replace the dynamic entries with a fresh discovery result.
    ///
    /// Entries named in `used` survive even when the new discovery no longer
    /// lists them. Discovered names shadowed by a static entry are dropped.
    pub fn refresh_dynamic(
        &mut self,
        discovered: Vec<Arc<dyn Capability>>,
        used: &HashSet<String>,
    ) {
        let discovered_names: HashSet<String> = discovered
            .iter()
            .map(|c| c.descriptor().name)
            .collect();

        let stale: Vec<String> = self
            .dynamic
            .iter()
            .filter(|name| !used.contains(*name) && !discovered_names.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            debug!(capability = %name, "dropping stale discovered capability");
            self.entries.remove(&name);
            self.dynamic.remove(&name);
            self.order.retain(|n| n != &name);
        }

        for capability in discovered {
            let name = capability.descriptor().name;
            if self.dynamic.contains(&name) {
                // Known dynamic entry, refresh in place.
                self.entries.insert(name, capability);
                continue;
            }
            if self.entries.contains_key(&name) {
                debug!(capability = %name, "discovered capability shadowed by static entry");
                continue;
            }
            self.order.push(name.clone());
            self.dynamic.insert(name.clone());
            self.entries.insert(name, capability);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.entries.get(name).cloned()
    }

    /// Descriptors in registration order, for the reasoning request.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.entries.get(name))
            .map(|c| c.descriptor())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Stub {
        name: &'static str,
    }

    #[async_trait]
    impl Capability for Stub {
        fn descriptor(&self) -> CapabilityDescriptor {
            CapabilityDescriptor {
                name: self.name.to_string(),
                description: String::new(),
                input_schema: json!({"type": "object"}),
            }
        }

        async fn invoke(&self, _args: Value, _ctx: &InvocationContext) -> InvocationOutput {
            InvocationOutput::ok(self.name)
        }
    }

    fn stub(name: &'static str) -> Arc<dyn Capability> {
        Arc::new(Stub { name })
    }

    #[test]
    fn static_registration_dedups_by_name() {
        let mut table = CapabilityTable::new();
        table.register(stub("read"));
        table.register(stub("read"));
        table.register(stub("write"));
        assert_eq!(table.len(), 2);
        let names: Vec<String> = table.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["read", "write"]);
    }

    #[test]
    fn refresh_keeps_used_dynamic_entries() {
        let mut table = CapabilityTable::new();
        table.refresh_dynamic(vec![stub("navigate"), stub("click")], &HashSet::new());
        assert_eq!(table.len(), 2);

        let used: HashSet<String> = ["click".to_string()].into();
        table.refresh_dynamic(vec![stub("navigate")], &used);
        assert!(table.get("navigate").is_some());
        assert!(table.get("click").is_some());

        table.refresh_dynamic(vec![stub("navigate")], &HashSet::new());
        assert!(table.get("click").is_none());
    }

    #[test]
    fn static_entry_shadows_discovered_name() {
        let mut table = CapabilityTable::new();
        table.register(stub("read"));
        table.refresh_dynamic(vec![stub("read"), stub("scroll")], &HashSet::new());
        assert_eq!(table.len(), 2);
        assert!(table.get("scroll").is_some());
    }
}
