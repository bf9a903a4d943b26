//! Explicit runtime context: the state store, the backend, and the task
//! lifetime shared by every execution started through it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::{ClientConfig, HttpBackend, WorkflowBackend};
use crate::error::ExecutionError;
use crate::store::ExecutionStore;
use crate::workflow::WorkflowExecutor;

pub struct ExecutionContext<B = HttpBackend> {
    config: ClientConfig,
    executor: WorkflowExecutor<B>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ExecutionContext<HttpBackend> {
    /// Open the state directory and an HTTP backend from `config`.
    pub async fn open(config: ClientConfig) -> Result<Self, ExecutionError> {
        let backend = HttpBackend::new(&config)?;
        Self::open_with_backend(config, backend).await
    }
}

impl<B: WorkflowBackend> ExecutionContext<B> {
    pub async fn open_with_backend(config: ClientConfig, backend: B) -> Result<Self, ExecutionError> {
        let store = match &config.state_dir {
            Some(dir) => ExecutionStore::open(dir).await?,
            None => ExecutionStore::open_default().await?,
        };
        tracing::debug!(
            "[ExecutionContext] Using state directory {}",
            store.state_dir().display()
        );

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let executor = WorkflowExecutor::with_runtime(
            Arc::new(backend),
            store,
            config.default_runner.clone(),
            shutdown.clone(),
            tracker.clone(),
        );

        Ok(Self {
            config,
            executor,
            shutdown,
            tracker,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn executor(&self) -> &WorkflowExecutor<B> {
        &self.executor
    }

    pub fn store(&self) -> &ExecutionStore {
        self.executor.store()
    }

    /// Cancel every in-flight execution and wait for their tasks to persist
    /// their final state. A task whose handle is still open and full waits
    /// for room to queue its terminal event, so drain or drop handles.
    pub async fn close(self) {
        let in_flight = self.tracker.len();
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if in_flight > 0 {
            tracing::info!(
                "[ExecutionContext] Closed with {} execution(s) interrupted",
                in_flight
            );
        }
    }
}
