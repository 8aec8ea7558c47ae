//! Per-invocation audit record.

use serde_json::Value;

use super::InvocationOutput;

/// Outcome of one policy stage, appended in the order stages ran.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Allowed { modified_args: bool },
    Blocked { reason: String },
    Skipped,
    Escalated { approved: bool },
    Retried { attempt: usize },
    Aborted,
    Continued,
    Observed,
}

/// One capability invocation, immutable once complete. A retry of the same
/// call produces a new record.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    /// Correlation id, distinct from the engine-assigned call id.
    pub id: String,
    pub name: String,
    pub arguments: Value,
    pub result: Option<InvocationOutput>,
    /// Side-channel messages emitted around the invocation (policy notes,
    /// escalation prompts).
    pub messages: Vec<String>,
    pub stages: Vec<StageOutcome>,
}

impl InvocationRecord {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments,
            result: None,
            messages: Vec::new(),
            stages: Vec::new(),
        }
    }

    pub fn record_stage(&mut self, outcome: StageOutcome) {
        self.stages.push(outcome);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn complete(&mut self, result: InvocationOutput) {
        self.result = Some(result);
    }

    pub fn is_error(&self) -> bool {
        self.result.as_ref().map_or(true, |r| r.is_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stages_accumulate_in_order() {
        let mut record = InvocationRecord::new("read", json!({"path": "a"}));
        record.record_stage(StageOutcome::Allowed {
            modified_args: false,
        });
        record.record_stage(StageOutcome::Retried { attempt: 1 });
        record.complete(InvocationOutput::ok("done"));

        assert_eq!(record.stages.len(), 2);
        assert!(!record.is_error());
    }

    #[test]
    fn incomplete_record_counts_as_error() {
        let record = InvocationRecord::new("read", json!({}));
        assert!(record.is_error());
    }
}
