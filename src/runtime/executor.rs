//! Capability dispatch through the policy pipeline.
//!
//! `dispatch_batch` takes the tool calls of one reasoning step, runs the
//! concurrency-capable subset together and the rest one by one, and stitches
//! every result back into request order. Each individual invocation passes
//! the policy stages in `invoke_one`.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::capability::{
    Capability, CapabilityTable, InvocationContext, InvocationOutput, InvocationRecord,
    StageOutcome,
};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::gateway::types::ToolCall;
use crate::runtime::context::AgentContext;
use crate::runtime::policy::{ApprovalGate, FailureAction, InvocationPolicy, PolicyDecision};

/// One stitched batch entry, in request order.
#[derive(Debug)]
pub struct BatchItem {
    pub call: ToolCall,
    pub output: InvocationOutput,
    pub record: InvocationRecord,
}

/// Run one invocation through pre-invocation policy, execution with failure
/// handling, and post-invocation observation.
///
/// Returns `Err` only for cancellation or a policy-mandated abort; every
/// other failure becomes an error-flagged `InvocationOutput`.
pub(crate) async fn invoke_one(
    capability: Arc<dyn Capability>,
    call: &ToolCall,
    policies: &[Arc<dyn InvocationPolicy>],
    approval: Option<&Arc<dyn ApprovalGate>>,
    ctx: &InvocationContext,
    config: &RuntimeConfig,
) -> Result<(InvocationOutput, InvocationRecord)> {
    let mut record = InvocationRecord::new(&call.name, call.arguments.clone());
    let mut args = call.arguments.clone();

    // ── pre-invocation ─────────────────────────────────────────────────
    let mut modified = false;
    for policy in policies {
        match policy.before_invoke(&call.name, &args, ctx).await {
            PolicyDecision::Allow { modified_args } => {
                if let Some(new_args) = modified_args {
                    debug!(capability = %call.name, policy = policy.name(), "arguments rewritten");
                    args = new_args;
                    modified = true;
                }
            }
            PolicyDecision::Block { reason } => {
                warn!(capability = %call.name, policy = policy.name(), reason = %reason, "invocation blocked");
                record.record_stage(StageOutcome::Blocked {
                    reason: reason.clone(),
                });
                let error = Error::Blocked {
                    name: call.name.clone(),
                    reason,
                };
                let output = InvocationOutput::error(error.to_string());
                record.complete(output.clone());
                return Ok((output, record));
            }
            PolicyDecision::Skip { output } => {
                record.record_stage(StageOutcome::Skipped);
                let output =
                    InvocationOutput::ok(output.unwrap_or_else(|| "skipped by policy".to_string()));
                record.complete(output.clone());
                return Ok((output, record));
            }
            PolicyDecision::Escalate { prompt } => {
                let approved = match approval {
                    Some(gate) => gate.approve(&ctx.agent_id, &call.name, &prompt, &args).await,
                    None => false,
                };
                record.record_stage(StageOutcome::Escalated { approved });
                record.note(prompt);
                if !approved {
                    let output = InvocationOutput::error(format!(
                        "invocation of '{}' denied on escalation",
                        call.name
                    ));
                    record.complete(output.clone());
                    return Ok((output, record));
                }
            }
        }
    }
    record.record_stage(StageOutcome::Allowed {
        modified_args: modified,
    });

    // ── invocation with failure handling ───────────────────────────────
    let mut attempts = 0usize;
    loop {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let started = Instant::now();
        let output = capability.invoke(args.clone(), ctx).await;
        attempts += 1;

        if !output.is_error {
            let elapsed = started.elapsed();
            for policy in policies {
                policy
                    .after_invoke(&call.name, &args, &output, elapsed)
                    .await;
            }
            if !policies.is_empty() {
                record.record_stage(StageOutcome::Observed);
            }
            record.complete(output.clone());
            return Ok((output, record));
        }

        // A cancelled call surfaces as an error output; keep the
        // distinguished kind instead of feeding it to failure policies.
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let error = Error::invocation(&call.name, &output.output);
        let action = failure_action(policies, &call.name, &args, &error, ctx).await;

        match action {
            FailureAction::Retry { max_attempts } if attempts < max_attempts => {
                record.record_stage(StageOutcome::Retried { attempt: attempts });
                tokio::time::sleep(config.backoff_delay(attempts - 1)).await;
            }
            FailureAction::Retry { .. } | FailureAction::Continue => {
                record.record_stage(StageOutcome::Continued);
                record.complete(output.clone());
                return Ok((output, record));
            }
            FailureAction::Skip { output } => {
                record.record_stage(StageOutcome::Skipped);
                let output = InvocationOutput::ok(
                    output.unwrap_or_else(|| "failure skipped by policy".to_string()),
                );
                record.complete(output.clone());
                return Ok((output, record));
            }
            FailureAction::Abort => {
                record.record_stage(StageOutcome::Aborted);
                return Err(error);
            }
            FailureAction::Escalate { prompt } => {
                let approved = match approval {
                    Some(gate) => gate.approve(&ctx.agent_id, &call.name, &prompt, &args).await,
                    None => false,
                };
                record.record_stage(StageOutcome::Escalated { approved });
                if !approved {
                    let output = InvocationOutput::error(format!(
                        "'{}' failed and escalation was denied: {}",
                        call.name, output.output
                    ));
                    record.complete(output.clone());
                    return Ok((output, record));
                }
                // Approved: one more try.
            }
        }
    }
}

async fn failure_action(
    policies: &[Arc<dyn InvocationPolicy>],
    capability: &str,
    args: &Value,
    error: &Error,
    ctx: &InvocationContext,
) -> FailureAction {
    for policy in policies {
        let action = policy.on_failure(capability, args, error, ctx).await;
        if action != FailureAction::Continue {
            return action;
        }
    }
    FailureAction::Continue
}

/// Dispatch one step's tool calls: capabilities that opt into concurrency
/// run together, the rest run sequentially, and the combined results come
/// back in request order once the whole batch is done.
pub(crate) async fn dispatch_batch(
    calls: &[ToolCall],
    table: &CapabilityTable,
    policies: &[Arc<dyn InvocationPolicy>],
    approval: Option<&Arc<dyn ApprovalGate>>,
    agent: &AgentContext,
    config: &RuntimeConfig,
) -> Result<Vec<BatchItem>> {
    let mut slots: Vec<Option<BatchItem>> = Vec::new();
    slots.resize_with(calls.len(), || None);

    let mut concurrent: Vec<(usize, Arc<dyn Capability>)> = Vec::new();
    let mut sequential: Vec<(usize, Arc<dyn Capability>)> = Vec::new();

    for (idx, call) in calls.iter().enumerate() {
        match table.get(&call.name) {
            Some(capability) if capability.supports_parallel() => {
                concurrent.push((idx, capability));
            }
            Some(capability) => sequential.push((idx, capability)),
            None => {
                let mut record = InvocationRecord::new(&call.name, call.arguments.clone());
                let output =
                    InvocationOutput::error(format!("unknown capability '{}'", call.name));
                record.complete(output.clone());
                slots[idx] = Some(BatchItem {
                    call: call.clone(),
                    output,
                    record,
                });
            }
        }
    }

    let futures = concurrent.into_iter().map(|(idx, capability)| {
        let ctx = agent.invocation_context();
        let call = &calls[idx];
        async move {
            let result = invoke_one(capability, call, policies, approval, &ctx, config).await;
            (idx, result)
        }
    });
    for (idx, result) in join_all(futures).await {
        let (output, record) = result?;
        slots[idx] = Some(BatchItem {
            call: calls[idx].clone(),
            output,
            record,
        });
    }

    for (idx, capability) in sequential {
        let ctx = agent.invocation_context();
        let (output, record) =
            invoke_one(capability, &calls[idx], policies, approval, &ctx, config).await?;
        slots[idx] = Some(BatchItem {
            call: calls[idx].clone(),
            output,
            record,
        });
    }

    Ok(slots.into_iter().flatten().collect())
}
