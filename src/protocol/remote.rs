//! Provider-discovered capability adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::capability::{Capability, CapabilityDescriptor, InvocationContext, InvocationOutput};
use crate::error::Error;
use crate::protocol::types::RemoteCapabilityDef;
use crate::protocol::ProviderClient;

/// A capability backed by a provider connection. Invocations go out as
/// `tools/call` requests under the caller's cancellation token; transport
/// failures come back as error-flagged outputs so the agent loop can decide
/// what to do with them.
pub struct RemoteCapability {
    definition: RemoteCapabilityDef,
    client: Arc<dyn ProviderClient>,
}

impl RemoteCapability {
    pub fn new(definition: RemoteCapabilityDef, client: Arc<dyn ProviderClient>) -> Self {
        Self { definition, client }
    }
}

#[async_trait]
impl Capability for RemoteCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.definition.clone().into()
    }

    async fn invoke(&self, args: Value, ctx: &InvocationContext) -> InvocationOutput {
        debug!(capability = %self.definition.name, agent = %ctx.agent_id, "invoking remote capability");
        match self
            .client
            .invoke(&self.definition.name, args, &ctx.cancel)
            .await
        {
            Ok(result) => {
                let text = result.text();
                if result.is_error {
                    InvocationOutput::error(text)
                } else {
                    InvocationOutput::ok(text)
                }
            }
            Err(Error::Cancelled) => InvocationOutput::error("invocation cancelled"),
            Err(err) => InvocationOutput::error(err.to_string()),
        }
    }
}
