//! Per-agent lifecycle event stream.
//!
//! Events are ordered per agent. A final event supersedes any earlier
//! partial event carrying the same call id; consumers render partials for
//! responsiveness and replace them when the final arrives.

use tokio::sync::mpsc;

use crate::gateway::types::{ToolCall, Usage};

#[derive(Debug, Clone)]
pub enum TaskEvent {
    TextDelta {
        agent_id: String,
        delta: String,
    },
    TextFinal {
        agent_id: String,
        text: String,
    },
    ToolCallPartial {
        agent_id: String,
        call_id: String,
        name: String,
    },
    ToolCallFinal {
        agent_id: String,
        call: ToolCall,
    },
    ToolResult {
        agent_id: String,
        call_id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    AgentError {
        agent_id: String,
        message: String,
    },
    Finished {
        agent_id: String,
        usage: Usage,
    },
}

pub type EventSink = mpsc::UnboundedSender<TaskEvent>;

/// Send an event, tolerating a departed consumer.
pub fn emit(sink: &EventSink, event: TaskEvent) {
    let _ = sink.send(event);
}
