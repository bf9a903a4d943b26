//! Caller-facing execution events.
//!
//! Every stream starts with [`ExecutionEvent::State`] and ends with exactly
//! one terminal event: [`ExecutionEvent::Complete`] or an
//! [`ExecutionEvent::Error`] with `terminal: true`.

use serde::Serialize;

use crate::models::{ExecutionState, ExecutionStatus, StepStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Snapshot of the record when the execution starts or resumes
    State {
        execution_id: String,
        message: String,
        state: Box<ExecutionState>,
    },
    /// A step lifecycle update; may repeat across reconnects
    Step {
        execution_id: String,
        name: String,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Plain output from the server
    Data { execution_id: String, data: String },
    Reconnecting {
        execution_id: String,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        reason: String,
    },
    Reconnected { execution_id: String, attempt: u32 },
    Error {
        execution_id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        hint: Option<String>,
        terminal: bool,
    },
    Complete {
        execution_id: String,
        status: ExecutionStatus,
        state: Box<ExecutionState>,
    },
}

impl ExecutionEvent {
    pub fn execution_id(&self) -> &str {
        match self {
            ExecutionEvent::State { execution_id, .. }
            | ExecutionEvent::Step { execution_id, .. }
            | ExecutionEvent::Data { execution_id, .. }
            | ExecutionEvent::Reconnecting { execution_id, .. }
            | ExecutionEvent::Reconnected { execution_id, .. }
            | ExecutionEvent::Error { execution_id, .. }
            | ExecutionEvent::Complete { execution_id, .. } => execution_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Complete { .. } | ExecutionEvent::Error { terminal: true, .. }
        )
    }
}
