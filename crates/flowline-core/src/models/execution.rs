use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stream::Frame;
use crate::workflow::schema::WorkflowExecutionRequest;

/// Error recorded on steps that precede a start-from step.
pub const SKIPPED_STEP_ERROR: &str = "Step skipped - starting from later step";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        }
    }

    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Terminal states a step never leaves.
    fn is_sticky(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending(name: impl Into<String>, description: Option<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            description,
            start_time: None,
            end_time: None,
            output: None,
            error: None,
        }
    }
}

/// Durable record of one workflow run, stored as `<execution_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub execution_id: String,
    pub workflow_name: String,
    pub runner: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub total_steps: usize,
    pub completed_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub step_history: Vec<StepState>,
    #[serde(default)]
    pub connection_lost: bool,
    #[serde(default)]
    pub retry_count: u32,
    pub original_request: WorkflowExecutionRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_event: Option<Frame>,
    /// Request id reported by the server on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_request_id: Option<String>,
    /// Last terminal error, if the run failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    /// A fresh `running` record with every declared step `pending`.
    pub fn new(
        execution_id: impl Into<String>,
        request: &WorkflowExecutionRequest,
        runner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            workflow_name: request.name.clone(),
            runner: runner.into(),
            status: ExecutionStatus::Running,
            start_time: now,
            last_update: now,
            end_time: None,
            total_steps: request.steps.len(),
            completed_steps: 0,
            current_step: None,
            step_history: request
                .steps
                .iter()
                .map(|s| StepState::pending(&s.name, s.description.clone()))
                .collect(),
            connection_lost: false,
            retry_count: 0,
            original_request: request.clone(),
            last_known_event: None,
            server_request_id: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.step_history.iter().find(|s| s.name == name)
    }

    /// Apply one step transition. Returns `false` when nothing changed.
    pub fn apply_step_update(
        &mut self,
        name: &str,
        status: StepStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> bool {
        if self.is_terminal() {
            tracing::debug!(
                "[ExecutionState] {} is {}, ignoring update for step '{}'",
                self.execution_id,
                self.status,
                name
            );
            return false;
        }

        let Some(step) = self.step_history.iter_mut().find(|s| s.name == name) else {
            tracing::warn!(
                "[ExecutionState] Update for undeclared step '{}' in {}, ignoring",
                name,
                self.execution_id
            );
            return false;
        };

        if step.status.is_sticky() || status == StepStatus::Pending {
            return false;
        }

        let now = Utc::now();
        match status {
            StepStatus::Running => {
                if step.status == StepStatus::Running {
                    return false;
                }
                if step.status == StepStatus::Failed {
                    step.end_time = None;
                    step.error = None;
                }
                step.status = StepStatus::Running;
                step.start_time.get_or_insert(now);
                self.current_step = Some(name.to_string());
            }
            terminal => {
                step.status = terminal;
                step.end_time.get_or_insert(now);
                if output.is_some() {
                    step.output = output;
                }
                if error.is_some() {
                    step.error = error;
                }
                if self.current_step.as_deref() == Some(name) {
                    self.current_step = None;
                }
            }
        }

        self.completed_steps = self
            .step_history
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        true
    }

    /// Move to `status`. No-op (returns `false`) once terminal or when unchanged.
    pub fn finish(&mut self, status: ExecutionStatus) -> bool {
        if self.is_terminal() || self.status == status {
            return false;
        }
        self.status = status;
        self.end_time = Some(Utc::now());
        if status.is_terminal() {
            self.connection_lost = false;
        }
        true
    }

    /// Put an interrupted record back into `running` for a resume.
    pub fn reopen(&mut self) -> bool {
        if self.status != ExecutionStatus::Interrupted {
            return false;
        }
        self.status = ExecutionStatus::Running;
        self.end_time = None;
        true
    }

    /// Mark the steps before `first` as skipped and shrink the step count.
    pub fn skip_steps_before(&mut self, first: usize) {
        let now = Utc::now();
        for step in self.step_history.iter_mut().take(first) {
            step.status = StepStatus::Skipped;
            step.end_time = Some(now);
            step.error = Some(SKIPPED_STEP_ERROR.to_string());
        }
        self.total_steps = self.step_history.len().saturating_sub(first);
    }

    /// One-line human summary, e.g. `Execution abc: running [1/3 steps] - 2m 5s`.
    pub fn summary(&self) -> String {
        let end = self.end_time.unwrap_or_else(Utc::now);
        let elapsed = (end - self.start_time).to_std().unwrap_or_default();
        let mut summary = format!("Execution {}: {}", self.execution_id, self.status);
        if self.connection_lost {
            summary.push_str(" (connection lost)");
        }
        summary.push_str(&format!(
            " [{}/{} steps] - {}",
            self.completed_steps,
            self.total_steps,
            format_duration(elapsed)
        ));
        summary
    }

    /// Whether the record has not been touched for longer than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        (Utc::now() - self.last_update)
            .to_std()
            .map(|age| age > threshold)
            .unwrap_or(false)
    }
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m {}s", m, s),
        (h, m, s) => format!("{}h {}m {}s", h, m, s),
    }
}
