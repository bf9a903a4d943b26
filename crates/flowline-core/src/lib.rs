//! Flowline Core — resilient client for server-streamed workflow executions.
//!
//! This crate contains everything below the command line: the streaming
//! wire format, the durable execution records, the backend seam, and the
//! executor that ties them together. It is usable from any async binary:
//!
//! ```no_run
//! # async fn demo() -> Result<(), flowline_core::ExecutionError> {
//! use flowline_core::{ClientConfig, ExecutionContext, WorkflowExecutionRequest};
//!
//! let ctx = ExecutionContext::open(ClientConfig::new("https://workflows.example.com/api/v1")).await?;
//! let request = WorkflowExecutionRequest::from_file("release.yaml")?;
//! let mut handle = ctx.executor().start(&request, None).await?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{:?}", event);
//! }
//! ctx.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod context;
pub mod error;
pub mod models;
pub mod store;
pub mod stream;
pub mod workflow;

// Convenience re-exports
pub use client::{ClientConfig, HttpBackend, WorkflowBackend};
pub use context::ExecutionContext;
pub use error::{describe_error, ExecutionError, StoreError, TransportError};
pub use models::{ExecutionState, ExecutionStatus, StepState, StepStatus};
pub use store::ExecutionStore;
pub use workflow::{
    ExecutionEvent, ExecutionHandle, ExecutionOptions, WorkflowExecutionRequest, WorkflowExecutor,
    WorkflowStep,
};
