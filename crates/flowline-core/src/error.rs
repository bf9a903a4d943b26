//! Core error types for flowline.
//!
//! Errors are split by concern so the executor can tell a dead connection
//! (retry) from a rejected request (stop) from a broken state directory
//! (refuse to run at all).

use std::path::PathBuf;
use std::time::Duration;

use crate::models::ExecutionStatus;

/// Failures talking to the Backend API or reading its stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("No frames received for {0:?}")]
    Inactivity(Duration),

    #[error("Stream ended before the workflow completed")]
    PrematureEnd,

    #[error("Server returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid request: {0}")]
    Request(String),
}

impl TransportError {
    /// Whether the executor should back off and reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connect(_)
            | TransportError::Timeout(_)
            | TransportError::Stream(_)
            | TransportError::Inactivity(_)
            | TransportError::PrematureEnd => true,
            TransportError::Status { status, .. } => matches!(status, 502..=504),
            TransportError::Request(_) => false,
        }
    }

    /// Classify a `reqwest` failure that happened before or while streaming.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::Request(err.to_string())
        } else if err.is_body() || err.is_decode() {
            TransportError::Stream(err.to_string())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Failures reading or writing the on-disk execution records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Invalid execution id: {0:?}")]
    InvalidId(String),

    #[error("Could not determine a state directory for this user")]
    NoStateDir,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced to callers of the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Execution {id} is already {status}")]
    AlreadyTerminal { id: String, status: ExecutionStatus },

    #[error("Step '{0}' not found in workflow")]
    StepNotFound(String),

    #[error("Failed to reconnect after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("Workflow failed: {0}")]
    WorkflowFailed(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Invalid workflow definition: {0}")]
    Definition(String),
}

/// Turn a raw server error text into something an operator can act on.
pub fn describe_error(error_text: &str) -> String {
    if error_text.is_empty() {
        return "Unknown error occurred".to_string();
    }

    let hints: &[(&[&str], &str)] = &[
        (
            &["context deadline exceeded"],
            "Connection timeout - a workflow step took too long or the connection was lost",
        ),
        (
            &["RUNNER_CONFIG_ERROR"],
            "Runner configuration error - the runner may not exist or be unavailable",
        ),
        (
            &["connection refused"],
            "Service unavailable - unable to reach the workflow execution service",
        ),
        (
            &["unauthorized", "403"],
            "Authentication error - check your API credentials",
        ),
        (
            &["500"],
            "Server error - temporary issue with the workflow execution service",
        ),
        (
            &["failed to fetch runner"],
            "Runner not found - ensure the runner exists and is available",
        ),
    ];

    for (needles, hint) in hints {
        if needles.iter().any(|n| error_text.contains(n)) {
            return hint.to_string();
        }
    }

    if let Some(start) = error_text.find("\"error\":\"") {
        let rest = &error_text[start + 9..];
        if let Some(end) = rest.find('"') {
            return rest[..end].to_string();
        }
    }

    if error_text.chars().count() > 200 {
        let head: String = error_text.chars().take(200).collect();
        format!("{}...", head)
    } else {
        error_text.to_string()
    }
}
