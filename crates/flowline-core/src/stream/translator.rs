//! EventTranslator — maps decoded frames onto workflow lifecycle events.
//!
//! Server payloads are decoded into [`ServerEvent`], one variant per declared
//! `type`. Unknown fields are ignored; a known event missing a field it needs
//! (such as a step name) is logged and dropped rather than failing the stream.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

use super::frame::{Frame, FrameTag};

/// Error texts that mean the run is over, not just a passing warning.
static FATAL_ERROR_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)context deadline exceeded",
        r"(?i)request deadline",
        r"(?i)request timed? ?out",
    ])
    .expect("fatal error patterns are valid regexes")
});

/// Closed vocabulary of events produced from the server stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// Plain-text output or a non-object payload, forwarded verbatim
    Data { data: String },
    /// First `step_running` seen for this step
    StepStarted { name: String },
    /// Repeated `step_running` for a step already announced
    StepRunning { name: String },
    StepCompleted {
        name: String,
        output: Option<String>,
    },
    StepFailed {
        name: String,
        output: Option<String>,
        error: Option<String>,
    },
    WorkflowCompleted { request_id: Option<String> },
    WorkflowFailed {
        request_id: Option<String>,
        reason: String,
    },
    /// Error frame; `fatal` ones are followed by `WorkflowFailed`
    Error { message: String, fatal: bool },
    /// Server signalled end of stream
    Done,
}

impl WorkflowEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowCompleted { .. } | WorkflowEvent::WorkflowFailed { .. }
        )
    }
}

/// Typed view of a JSON payload, keyed by its `type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    StepRunning {
        #[serde(default)]
        step: Option<StepPayload>,
    },
    StepComplete {
        #[serde(default)]
        step: Option<StepPayload>,
    },
    WorkflowComplete {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct StepPayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl StepPayload {
    fn output_text(&self) -> Option<String> {
        match &self.output {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Stateful translator; one per execution so repeated `step_running`
/// frames after a reconnect come out as [`WorkflowEvent::StepRunning`].
#[derive(Debug, Default)]
pub struct EventTranslator {
    started: HashSet<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate one frame into zero or more events.
    pub fn translate(&mut self, frame: &Frame) -> Vec<WorkflowEvent> {
        match classify(&frame.tag) {
            FrameKind::Done => vec![WorkflowEvent::Done],
            FrameKind::Error => translate_error(&frame.payload),
            FrameKind::Data => self.translate_data(&frame.payload),
        }
    }

    fn translate_data(&mut self, payload: &str) -> Vec<WorkflowEvent> {
        let value: serde_json::Value = match serde_json::from_str(payload) {
            Ok(v @ serde_json::Value::Object(_)) => v,
            _ => {
                return vec![WorkflowEvent::Data {
                    data: payload.to_string(),
                }]
            }
        };

        let event: ServerEvent = match serde_json::from_value(value) {
            Ok(ev) => ev,
            Err(e) => {
                tracing::debug!("[EventTranslator] Dropping malformed server event: {}", e);
                return Vec::new();
            }
        };

        match event {
            ServerEvent::StepRunning { step } => {
                let Some(name) = step.and_then(|s| s.name) else {
                    tracing::debug!("[EventTranslator] step_running without step.name, dropped");
                    return Vec::new();
                };
                if self.started.insert(name.clone()) {
                    vec![WorkflowEvent::StepStarted { name }]
                } else {
                    vec![WorkflowEvent::StepRunning { name }]
                }
            }
            ServerEvent::StepComplete { step } => {
                let step = step.unwrap_or_default();
                let output = step.output_text();
                let Some(name) = step.name else {
                    tracing::debug!("[EventTranslator] step_complete without step.name, dropped");
                    return Vec::new();
                };
                match step.status.as_deref() {
                    Some("finished") => vec![WorkflowEvent::StepCompleted { name, output }],
                    Some("failed") => vec![WorkflowEvent::StepFailed {
                        name,
                        output,
                        error: Some(
                            step.error
                                .unwrap_or_else(|| "step execution failed".to_string()),
                        ),
                    }],
                    other => {
                        tracing::warn!(
                            "[EventTranslator] Step '{}' completed with unexpected status {:?}, treating as completed",
                            name,
                            other
                        );
                        vec![WorkflowEvent::StepCompleted { name, output }]
                    }
                }
            }
            ServerEvent::WorkflowComplete {
                status,
                success,
                request_id,
                error,
            } => {
                if status.as_deref() == Some("finished") && success == Some(true) {
                    vec![WorkflowEvent::WorkflowCompleted { request_id }]
                } else {
                    let reason = error.unwrap_or_else(|| {
                        format!(
                            "workflow finished with status {} (success: {})",
                            status.as_deref().unwrap_or("<missing>"),
                            success.map_or("<missing>".to_string(), |s| s.to_string())
                        )
                    });
                    vec![WorkflowEvent::WorkflowFailed { request_id, reason }]
                }
            }
            ServerEvent::Unknown => {
                tracing::debug!("[EventTranslator] Ignoring server event of unknown type");
                Vec::new()
            }
        }
    }
}

enum FrameKind {
    Data,
    Error,
    Done,
}

fn classify(tag: &FrameTag) -> FrameKind {
    match tag {
        FrameTag::Char('e') => FrameKind::Error,
        FrameTag::Char('d') => FrameKind::Done,
        // '2' is data, '3' carries error details inside a data payload
        FrameTag::Char(_) => FrameKind::Data,
        FrameTag::Event(name) => match name.as_str() {
            "error" => FrameKind::Error,
            "done" | "end" => FrameKind::Done,
            _ => FrameKind::Data,
        },
        FrameTag::Data => FrameKind::Data,
    }
}

fn translate_error(payload: &str) -> Vec<WorkflowEvent> {
    // Compact error frames usually carry a JSON string literal
    let message = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::String(s)) => s,
        _ => payload.to_string(),
    };
    let fatal = is_fatal_error(&message);
    let mut events = vec![WorkflowEvent::Error {
        message: message.clone(),
        fatal,
    }];
    if fatal {
        events.push(WorkflowEvent::WorkflowFailed {
            request_id: None,
            reason: message,
        });
    }
    events
}

/// Whether an error text should end the run.
pub fn is_fatal_error(message: &str) -> bool {
    FATAL_ERROR_PATTERNS.is_match(message)
}
