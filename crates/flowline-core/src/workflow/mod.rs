//! Workflow execution — definitions, options, and the resilient executor.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowExecutionRequest ──► WorkflowExecutor
//!                                                    │
//!                          WorkflowBackend (HTTP) ◄──┤
//!                                 │                  │
//!                   FrameDecoder ─► EventTranslator  │
//!                                 │                  │
//!                        ExecutionStore ◄────────────┤
//!                                                    ▼
//!                                          ExecutionHandle (events)
//! ```

pub mod events;
pub mod executor;
pub mod options;
pub mod schema;

pub use events::ExecutionEvent;
pub use executor::{ExecutionHandle, WorkflowExecutor};
pub use options::{ExecutionOptions, RetryPolicy};
pub use schema::{WithFiles, WorkflowExecutionRequest, WorkflowStep};
