//! Reasoning gateway.
//!
//! Wraps the external reasoning engine behind a "generate next step"
//! contract: one request out, a demultiplexed stream of partial events back,
//! folded into a single `StepOutcome`. The gateway owns transcript
//! compression (once per oversized transcript, before the request goes out),
//! the forced compression retry on a `length` finish, and exponential
//! backoff on transport failures.

pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::events::{emit, EventSink, TaskEvent};

use types::{
    estimate_chars, FinishReason, GenerateRequest, ModelMessage, StreamPart, ToolCall, ToolChoice,
    Usage,
};

use crate::capability::CapabilityDescriptor;

/// External reasoning engine, consumed via two contracts: stream the next
/// step, and compress an oversized transcript into a shorter equivalent.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>>;

    async fn compress(&self, messages: Vec<ModelMessage>) -> anyhow::Result<Vec<ModelMessage>>;
}

/// Folded result of one reasoning step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

impl StepOutcome {
    /// Text is only a candidate final answer when no tool calls accompany it.
    pub fn is_final_text(&self) -> bool {
        !self.text.is_empty() && self.tool_calls.is_empty()
    }
}

enum Consumed {
    Complete(StepOutcome),
    Failed(String),
}

pub struct Gateway {
    engine: Arc<dyn ReasoningEngine>,
    config: RuntimeConfig,
}

impl Gateway {
    pub fn new(engine: Arc<dyn ReasoningEngine>, config: RuntimeConfig) -> Self {
        Self { engine, config }
    }

    /// Issue one "next step" request and fold its stream.
    ///
    /// `messages` is compressed in place when it exceeds the configured
    /// threshold, so the caller's transcript reflects what was actually
    /// sent.
    pub async fn generate_step(
        &self,
        agent_id: &str,
        messages: &mut Vec<ModelMessage>,
        capabilities: Vec<CapabilityDescriptor>,
        tool_choice: Option<ToolChoice>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome> {
        if estimate_chars(messages) > self.config.compress_threshold_chars {
            self.compress_in_place(messages).await;
        }

        let mut attempt = 0usize;
        let mut length_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let request = GenerateRequest {
                messages: messages.clone(),
                capabilities: capabilities.clone(),
                tool_choice: tool_choice.clone(),
            };

            let failure = match self.engine.generate(request).await {
                Ok(rx) => match self.consume(agent_id, rx, events, cancel).await? {
                    Consumed::Complete(outcome) => match outcome.finish_reason {
                        FinishReason::Length if !length_retried => {
                            info!(agent = %agent_id, "length finish, compressing and retrying");
                            length_retried = true;
                            self.compress_in_place(messages).await;
                            continue;
                        }
                        FinishReason::ContentFilter => {
                            return Err(Error::Reasoning(
                                "generation stopped by content filter".to_string(),
                            ));
                        }
                        FinishReason::Other(ref reason) => {
                            return Err(Error::Reasoning(format!(
                                "generation stopped: {reason}"
                            )));
                        }
                        _ => return Ok(outcome),
                    },
                    Consumed::Failed(message) => message,
                },
                Err(e) => e.to_string(),
            };

            emit(
                events,
                TaskEvent::AgentError {
                    agent_id: agent_id.to_string(),
                    message: failure.clone(),
                },
            );

            if attempt >= self.config.max_retries {
                return Err(Error::Reasoning(format!(
                    "engine failed after {} attempts: {failure}",
                    attempt + 1
                )));
            }
            if looks_oversized(&failure) {
                self.compress_in_place(messages).await;
            }

            let delay = self.config.backoff_delay(attempt);
            warn!(
                agent = %agent_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "engine failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Compress the transcript, keeping the original on engine failure.
    async fn compress_in_place(&self, messages: &mut Vec<ModelMessage>) {
        let before = estimate_chars(messages);
        match self.engine.compress(messages.clone()).await {
            Ok(compressed) => {
                debug!(
                    before_chars = before,
                    after_chars = estimate_chars(&compressed),
                    "transcript compressed"
                );
                *messages = compressed;
            }
            Err(e) => warn!(error = %e, "compression failed, keeping transcript"),
        }
    }

    /// Demultiplex one response stream into a `StepOutcome`, forwarding
    /// lifecycle events as parts arrive.
    async fn consume(
        &self,
        agent_id: &str,
        mut rx: mpsc::UnboundedReceiver<StreamPart>,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Consumed> {
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut usage = Usage::default();
        let mut finish_reason: Option<FinishReason> = None;

        loop {
            let part = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                part = rx.recv() => part,
            };
            let Some(part) = part else { break };

            match part {
                StreamPart::TextDelta { delta } => {
                    emit(
                        events,
                        TaskEvent::TextDelta {
                            agent_id: agent_id.to_string(),
                            delta: delta.clone(),
                        },
                    );
                    text.push_str(&delta);
                }
                StreamPart::ToolCallStart { id, name } => {
                    emit(
                        events,
                        TaskEvent::ToolCallPartial {
                            agent_id: agent_id.to_string(),
                            call_id: id,
                            name,
                        },
                    );
                }
                StreamPart::ToolArgsDelta { .. } => {
                    // Argument fragments are only useful to the engine's own
                    // accumulator; the finalized call follows.
                }
                StreamPart::ToolCallComplete { tool_call } => {
                    emit(
                        events,
                        TaskEvent::ToolCallFinal {
                            agent_id: agent_id.to_string(),
                            call: tool_call.clone(),
                        },
                    );
                    tool_calls.push(tool_call);
                }
                StreamPart::Usage { usage: u } => usage.add(&u),
                StreamPart::Finish { reason } => {
                    finish_reason = Some(reason);
                    break;
                }
                StreamPart::Error { error } => return Ok(Consumed::Failed(error)),
            }
        }

        let Some(finish_reason) = finish_reason else {
            return Ok(Consumed::Failed("stream ended without finish".to_string()));
        };

        Ok(Consumed::Complete(StepOutcome {
            text,
            tool_calls,
            finish_reason,
            usage,
        }))
    }
}

fn looks_oversized(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("too large")
        || lower.contains("too long")
        || lower.contains("context length")
        || lower.contains("maximum context")
        || lower.contains("token limit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    enum Scripted {
        Parts(Vec<StreamPart>),
        Fail(&'static str),
    }

    struct ScriptedEngine {
        script: Mutex<VecDeque<Scripted>>,
        generate_calls: AtomicUsize,
        compress_calls: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                generate_calls: AtomicUsize::new(0),
                compress_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ReasoningEngine for ScriptedEngine {
        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> anyhow::Result<mpsc::UnboundedReceiver<StreamPart>> {
            self.generate_calls.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().await.pop_front() {
                Some(Scripted::Parts(parts)) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    for part in parts {
                        let _ = tx.send(part);
                    }
                    Ok(rx)
                }
                Some(Scripted::Fail(message)) => Err(anyhow::anyhow!(message)),
                None => Err(anyhow::anyhow!("script exhausted")),
            }
        }

        async fn compress(
            &self,
            _messages: Vec<ModelMessage>,
        ) -> anyhow::Result<Vec<ModelMessage>> {
            self.compress_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![ModelMessage::user("compressed")])
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            retry_base_delay_ms: 1,
            ..RuntimeConfig::default()
        }
    }

    fn sink() -> (EventSink, mpsc::UnboundedReceiver<TaskEvent>) {
        mpsc::unbounded_channel()
    }

    fn finish(reason: FinishReason) -> StreamPart {
        StreamPart::Finish { reason }
    }

    #[tokio::test]
    async fn plain_text_step_is_final() {
        let engine = ScriptedEngine::new(vec![Scripted::Parts(vec![
            StreamPart::TextDelta {
                delta: "done".to_string(),
            },
            finish(FinishReason::Stop),
        ])]);
        let gateway = Gateway::new(engine.clone(), fast_config());
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        let outcome = gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "done");
        assert!(outcome.is_final_text());
        assert_eq!(engine.compress_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_transcript_compresses_exactly_once() {
        let engine = ScriptedEngine::new(vec![Scripted::Parts(vec![finish(FinishReason::Stop)])]);
        let config = RuntimeConfig {
            compress_threshold_chars: 8,
            ..fast_config()
        };
        let gateway = Gateway::new(engine.clone(), config);
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("well over eight characters")];

        gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(engine.compress_calls.load(Ordering::SeqCst), 1);
        assert_eq!(messages, vec![ModelMessage::user("compressed")]);
    }

    #[tokio::test]
    async fn length_finish_forces_compression_and_one_retry() {
        let engine = ScriptedEngine::new(vec![
            Scripted::Parts(vec![finish(FinishReason::Length)]),
            Scripted::Parts(vec![
                StreamPart::TextDelta {
                    delta: "short".to_string(),
                },
                finish(FinishReason::Stop),
            ]),
        ]);
        let gateway = Gateway::new(engine.clone(), fast_config());
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        let outcome = gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "short");
        assert_eq!(engine.generate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.compress_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failure_retries_then_succeeds() {
        let engine = ScriptedEngine::new(vec![
            Scripted::Fail("connection reset"),
            Scripted::Parts(vec![finish(FinishReason::Stop)]),
        ]);
        let gateway = Gateway::new(engine.clone(), fast_config());
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(engine.generate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_reasoning_error() {
        let engine = ScriptedEngine::new(vec![
            Scripted::Fail("boom"),
            Scripted::Fail("boom"),
        ]);
        let config = RuntimeConfig {
            max_retries: 1,
            ..fast_config()
        };
        let gateway = Gateway::new(engine, config);
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        let err = gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reasoning(_)));
    }

    #[tokio::test]
    async fn oversized_failure_compresses_before_retry() {
        let engine = ScriptedEngine::new(vec![
            Scripted::Fail("request exceeds maximum context"),
            Scripted::Parts(vec![finish(FinishReason::Stop)]),
        ]);
        let gateway = Gateway::new(engine.clone(), fast_config());
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(engine.compress_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn content_filter_finish_aborts() {
        let engine =
            ScriptedEngine::new(vec![Scripted::Parts(vec![finish(FinishReason::ContentFilter)])]);
        let gateway = Gateway::new(engine, fast_config());
        let (events, _rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        let err = gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Reasoning(_)));
    }

    #[tokio::test]
    async fn tool_calls_make_text_non_final() {
        let call = ToolCall {
            id: "c1".to_string(),
            name: "read".to_string(),
            arguments: json!({"path": "a.txt"}),
        };
        let engine = ScriptedEngine::new(vec![Scripted::Parts(vec![
            StreamPart::TextDelta {
                delta: "looking".to_string(),
            },
            StreamPart::ToolCallStart {
                id: "c1".to_string(),
                name: "read".to_string(),
            },
            StreamPart::ToolArgsDelta {
                id: "c1".to_string(),
                delta: "{\"path\"".to_string(),
            },
            StreamPart::ToolCallComplete {
                tool_call: call.clone(),
            },
            finish(FinishReason::ToolCalls),
        ])]);
        let gateway = Gateway::new(engine, fast_config());
        let (events, mut rx) = sink();
        let mut messages = vec![ModelMessage::user("task")];

        let outcome = gateway
            .generate_step(
                "a-0",
                &mut messages,
                vec![],
                None,
                &events,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!outcome.is_final_text());
        assert_eq!(outcome.tool_calls, vec![call]);

        // Partial precedes final on the event stream.
        let mut saw_partial = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TaskEvent::ToolCallPartial { .. } => saw_partial = true,
                TaskEvent::ToolCallFinal { .. } => assert!(saw_partial),
                _ => {}
            }
        }
        assert!(saw_partial);
    }
}
