//! Agent runtime.
//!
//! Drives a compiled plan: stages run in order, siblings inside a parallel
//! stage run concurrently with independent contexts, and each agent loops
//! through reason/act iterations until it produces a final answer, trips the
//! circuit breaker, or hits the iteration cap. Agent failures are contained
//! to the agent; only cancellation unwinds the whole task.

pub mod context;
pub mod events;
pub mod executor;
pub mod policy;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::capability::{Capability, CapabilityTable};
use crate::compiler::{self, StageNode};
use crate::config::{CapabilityRefresh, RuntimeConfig};
use crate::error::{Error, Result};
use crate::gateway::types::{Content, ModelMessage};
use crate::gateway::{Gateway, ReasoningEngine};
use crate::plan::{AgentStatus, Plan, PlanNode};
use crate::protocol::{ProviderClient, RemoteCapability};

use context::{AgentContext, TaskContext};
use events::{emit, EventSink, TaskEvent};
use executor::dispatch_batch;
use policy::{ApprovalGate, InvocationPolicy};

pub struct AgentRuntime {
    config: RuntimeConfig,
    gateway: Gateway,
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    static_capabilities: Vec<Arc<dyn Capability>>,
    policies: Vec<Arc<dyn InvocationPolicy>>,
    approval: Option<Arc<dyn ApprovalGate>>,
    events: EventSink,
}

impl AgentRuntime {
    pub fn new(engine: Arc<dyn ReasoningEngine>, config: RuntimeConfig, events: EventSink) -> Self {
        Self {
            gateway: Gateway::new(engine, config.clone()),
            config,
            providers: HashMap::new(),
            static_capabilities: Vec::new(),
            policies: Vec::new(),
            approval: None,
            events,
        }
    }

    /// Register a capability provider under the name plan agents refer to.
    pub fn register_provider(&mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.providers.insert(name.into(), client);
    }

    /// Register a capability available to every agent.
    pub fn register_capability(&mut self, capability: Arc<dyn Capability>) {
        self.static_capabilities.push(capability);
    }

    /// Append a policy; policies run in registration order.
    pub fn add_policy(&mut self, policy: Arc<dyn InvocationPolicy>) {
        self.policies.push(policy);
    }

    pub fn set_approval_gate(&mut self, gate: Arc<dyn ApprovalGate>) {
        self.approval = Some(gate);
    }

    /// Execute a plan to completion and return it with final agent statuses.
    ///
    /// `cancel` is the task-wide token; cancelling it aborts every running
    /// agent and returns `Error::Cancelled`.
    pub async fn run_plan(&self, mut plan: Plan, task: Arc<TaskContext>) -> Result<Plan> {
        let stages = compiler::compile(&mut plan)?;
        info!(plan = %plan.id, stages = stages.stage_count(), "plan compiled");

        let plan = Arc::new(RwLock::new(plan));
        let mut current: Option<&StageNode> = Some(&stages);

        while let Some(stage) = current {
            match stage {
                StageNode::Normal { agent_id, next } => {
                    self.run_agent(&plan, &task, agent_id).await?;
                    current = next.as_deref();
                }
                StageNode::Parallel { agent_ids, next } => {
                    let siblings = agent_ids
                        .iter()
                        .map(|id| self.run_agent(&plan, &task, id));
                    for outcome in join_all(siblings).await {
                        outcome?;
                    }
                    current = next.as_deref();
                }
            }
        }

        let plan = Arc::try_unwrap(plan)
            .map_err(|_| Error::Reasoning("plan still borrowed after completion".to_string()))?;
        Ok(plan.into_inner())
    }

    /// Run one agent to a terminal status.
    ///
    /// Contains every agent-level failure by recording `Error` status; only
    /// cancellation propagates.
    async fn run_agent(
        &self,
        plan: &Arc<RwLock<Plan>>,
        task: &Arc<TaskContext>,
        agent_id: &str,
    ) -> Result<()> {
        let (provider, prompt) = {
            let plan = plan.read().await;
            let Some(agent) = plan.agent(agent_id) else {
                warn!(agent = %agent_id, "agent missing from plan, skipping");
                return Ok(());
            };
            if agent.status.is_terminal() {
                debug!(agent = %agent_id, "agent already terminal, skipping");
                return Ok(());
            }
            (agent.provider.clone(), compose_prompt(agent.task.as_str(), &agent.nodes))
        };

        plan.write()
            .await
            .set_status(agent_id, AgentStatus::Running, None);
        info!(agent = %agent_id, provider = %provider, "agent started");

        let mut ctx = AgentContext::new(agent_id, Arc::clone(task));
        ctx.transcript.push(ModelMessage::system(
            "You are an autonomous agent executing one sub-task of a larger plan. \
             Use the available capabilities to complete your task, then answer \
             with a plain-text summary of the result.",
        ));
        ctx.transcript.push(ModelMessage::user(prompt));

        let outcome = self.drive_loop(&mut ctx, &provider).await;

        if let Some(client) = self.providers.get(&provider) {
            if let Err(e) = client.close().await {
                warn!(agent = %agent_id, provider = %provider, error = %e, "provider close failed");
            }
        }

        match outcome {
            Ok(final_text) => {
                emit(
                    &self.events,
                    TaskEvent::TextFinal {
                        agent_id: agent_id.to_string(),
                        text: final_text,
                    },
                );
                emit(
                    &self.events,
                    TaskEvent::Finished {
                        agent_id: agent_id.to_string(),
                        usage: ctx.usage.clone(),
                    },
                );
                plan.write()
                    .await
                    .set_status(agent_id, AgentStatus::Done, None);
                info!(agent = %agent_id, "agent done");
                Ok(())
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                let message = e.to_string();
                warn!(agent = %agent_id, error = %message, "agent failed");
                emit(
                    &self.events,
                    TaskEvent::AgentError {
                        agent_id: agent_id.to_string(),
                        message: message.clone(),
                    },
                );
                emit(
                    &self.events,
                    TaskEvent::Finished {
                        agent_id: agent_id.to_string(),
                        usage: ctx.usage.clone(),
                    },
                );
                plan.write()
                    .await
                    .set_status(agent_id, AgentStatus::Error, Some(message));
                Ok(())
            }
        }
    }

    /// The reason/act loop. Returns the agent's final answer text.
    async fn drive_loop(&self, ctx: &mut AgentContext, provider: &str) -> Result<String> {
        let mut table = CapabilityTable::new();
        for capability in &self.static_capabilities {
            table.register(Arc::clone(capability));
        }

        let mut double_checked = false;

        for iteration in 0..self.config.max_iterations {
            if ctx.task.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let refresh_now = match self.config.capability_refresh {
                CapabilityRefresh::FirstIteration => iteration == 0,
                CapabilityRefresh::EveryIteration => true,
            };
            if refresh_now {
                self.refresh_capabilities(provider, &mut table, ctx).await?;
            }

            let step = self
                .gateway
                .generate_step(
                    &ctx.agent_id,
                    &mut ctx.transcript,
                    table.descriptors(),
                    None,
                    &self.events,
                    &ctx.task.cancel,
                )
                .await?;
            ctx.usage.add(&step.usage);

            let mut assistant = Vec::new();
            if !step.text.is_empty() {
                assistant.push(Content::Text {
                    text: step.text.clone(),
                });
            }
            for call in &step.tool_calls {
                assistant.push(Content::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.arguments.clone(),
                });
            }
            if !assistant.is_empty() {
                ctx.transcript.push(ModelMessage::assistant(assistant));
            }

            if step.tool_calls.is_empty() {
                if self.config.double_check_completion && !double_checked {
                    double_checked = true;
                    debug!(agent = %ctx.agent_id, "double-checking completion");
                    ctx.transcript.push(ModelMessage::user(
                        "Is the task fully complete? If so, restate the final \
                         answer. Otherwise, continue working.",
                    ));
                    continue;
                }
                return Ok(step.text);
            }

            let items = dispatch_batch(
                &step.tool_calls,
                &table,
                &self.policies,
                self.approval.as_ref(),
                ctx,
                &self.config,
            )
            .await?;

            for item in items {
                emit(
                    &self.events,
                    TaskEvent::ToolResult {
                        agent_id: ctx.agent_id.clone(),
                        call_id: item.call.id.clone(),
                        name: item.call.name.clone(),
                        output: item.output.output.clone(),
                        is_error: item.output.is_error,
                    },
                );
                ctx.transcript.push(ModelMessage::tool_result(
                    &item.call.id,
                    json!(item.output.output),
                    item.output.is_error,
                ));
                ctx.used_capabilities.insert(item.call.name.clone());

                if item.output.is_error {
                    ctx.consecutive_errors += 1;
                } else {
                    ctx.consecutive_errors = 0;
                }
                let last_error = item.output.output.clone();
                ctx.records.push(item.record);

                if ctx.consecutive_errors >= self.config.consecutive_failure_limit {
                    return Err(Error::invocation(
                        &item.call.name,
                        format!(
                            "{} consecutive invocation failures, last: {last_error}",
                            ctx.consecutive_errors
                        ),
                    ));
                }
            }
        }

        // Iteration cap reached; a synthetic answer, not an error.
        warn!(
            agent = %ctx.agent_id,
            limit = self.config.max_iterations,
            "iteration limit reached"
        );
        Ok(format!(
            "Stopped after {} iterations without a final answer; the work so \
             far is recorded in the transcript.",
            self.config.max_iterations
        ))
    }

    /// Discover the provider's capabilities and merge them into the table.
    /// Connects lazily on first use.
    async fn refresh_capabilities(
        &self,
        provider: &str,
        table: &mut CapabilityTable,
        ctx: &AgentContext,
    ) -> Result<()> {
        let Some(client) = self.providers.get(provider) else {
            debug!(provider = %provider, "no provider registered, static capabilities only");
            return Ok(());
        };

        if !client.is_connected().await {
            client.connect(&ctx.task.cancel).await?;
        }
        let defs = client
            .list_capabilities(None, &ctx.task.cancel)
            .await?;
        debug!(provider = %provider, count = defs.len(), "capabilities discovered");

        let discovered: Vec<Arc<dyn Capability>> = defs
            .into_iter()
            .map(|def| {
                Arc::new(RemoteCapability::new(def, Arc::clone(client))) as Arc<dyn Capability>
            })
            .collect();
        table.refresh_dynamic(discovered, &ctx.used_capabilities);
        Ok(())
    }
}

/// Render the agent's task and node breakdown into the opening user message.
fn compose_prompt(task: &str, nodes: &[PlanNode]) -> String {
    let mut prompt = String::from(task);
    if !nodes.is_empty() {
        prompt.push_str("\n\nTask breakdown:\n");
        render_nodes(nodes, 0, &mut prompt);
    }
    prompt
}

fn render_nodes(nodes: &[PlanNode], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node {
            PlanNode::Step { text, input, output } => {
                out.push_str(&indent);
                out.push_str("- ");
                out.push_str(text);
                if let Some(input) = input {
                    out.push_str(&format!(" (reads ${input})"));
                }
                if let Some(output) = output {
                    out.push_str(&format!(" (stores ${output})"));
                }
                out.push('\n');
            }
            PlanNode::ForEach { items, steps } => {
                out.push_str(&format!("{indent}- for each item in ${items}:\n"));
                render_nodes(steps, depth + 1, out);
            }
            PlanNode::Watch {
                event,
                looping,
                description,
                triggers,
            } => {
                let rearm = if *looping { ", re-armed after firing" } else { "" };
                out.push_str(&format!("{indent}- on event \"{event}\"{rearm}: {description}\n"));
                render_nodes(triggers, depth + 1, out);
            }
        }
    }
}
