//! Workflow Executor — runs one server-side workflow and survives the
//! connection dropping underneath it.
//!
//! Per attempt the executor:
//! 1. Submits the stored request to the backend
//! 2. Decodes the byte stream into frames and translates them into events
//! 3. Persists every step transition before telling the caller about it
//! 4. Watches for silence with a heartbeat task
//! 5. On a retryable failure, backs off and submits the same request again
//!
//! ```text
//! Connecting ──► Streaming ──► Completed / Failed
//!     ▲              │
//!     └── backoff ◄── Disconnected ──► Failed (retries exhausted)
//! ```
//!
//! Reconnecting re-submits the request; the backend has no way to attach to
//! the original run, so a reconnect can start a second server-side run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::client::config::DEFAULT_RUNNER;
use crate::client::WorkflowBackend;
use crate::error::{describe_error, ExecutionError, StoreError, TransportError};
use crate::models::{ExecutionState, ExecutionStatus, StepStatus};
use crate::store::ExecutionStore;
use crate::stream::{EventTranslator, Frame, FrameDecoder, WorkflowEvent};
use crate::workflow::events::ExecutionEvent;
use crate::workflow::options::ExecutionOptions;
use crate::workflow::schema::WorkflowExecutionRequest;

/// Starts and resumes executions against a backend.
pub struct WorkflowExecutor<B> {
    backend: Arc<B>,
    store: ExecutionStore,
    default_runner: String,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// The caller's end of one running execution.
///
/// Events arrive in order; the queue closes after the terminal event.
pub struct ExecutionHandle {
    execution_id: String,
    events: mpsc::Receiver<ExecutionEvent>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Next event, or `None` once the execution has finished.
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Request cancellation. The execution is persisted as `interrupted`
    /// and the stream still ends with a terminal event.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain the stream and return the terminal event.
    pub async fn wait(mut self) -> Option<ExecutionEvent> {
        let mut terminal = None;
        while let Some(event) = self.events.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        terminal
    }
}

impl<B: WorkflowBackend> WorkflowExecutor<B> {
    pub fn new(backend: B, store: ExecutionStore) -> Self {
        Self::with_runtime(
            Arc::new(backend),
            store,
            DEFAULT_RUNNER.to_string(),
            CancellationToken::new(),
            TaskTracker::new(),
        )
    }

    /// Build an executor whose tasks hang off `shutdown` and `tracker`.
    pub fn with_runtime(
        backend: Arc<B>,
        store: ExecutionStore,
        default_runner: String,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            backend,
            store,
            default_runner,
            shutdown,
            tracker,
        }
    }

    pub fn with_default_runner(mut self, runner: impl Into<String>) -> Self {
        self.default_runner = runner.into();
        self
    }

    pub fn store(&self) -> &ExecutionStore {
        &self.store
    }

    pub async fn start(
        &self,
        request: &WorkflowExecutionRequest,
        runner: Option<&str>,
    ) -> Result<ExecutionHandle, ExecutionError> {
        self.start_with_options(request, runner, ExecutionOptions::default())
            .await
    }

    /// Persist a new execution and start streaming it.
    ///
    /// The record exists on disk before the first connection attempt, so a
    /// crash at any later point leaves something to resume.
    pub async fn start_with_options(
        &self,
        request: &WorkflowExecutionRequest,
        runner: Option<&str>,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, ExecutionError> {
        request.validate()?;
        let runner = runner
            .map(str::to_string)
            .or_else(|| request.runner.clone())
            .unwrap_or_else(|| self.default_runner.clone());

        let (state, message) = match &options.start_from_step {
            Some(step) => {
                let state = self.store.create_from_step(request, &runner, step).await?;
                let message = format!(
                    "Starting workflow execution from step '{}': {}",
                    step, state.workflow_name
                );
                (state, message)
            }
            None => {
                let state = self.store.create(request, &runner).await?;
                let message = format!("Starting workflow execution: {}", state.workflow_name);
                (state, message)
            }
        };

        Ok(self.spawn(state, options, message))
    }

    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionHandle, ExecutionError> {
        self.resume_with_options(execution_id, ExecutionOptions::default())
            .await
    }

    /// Continue a non-terminal execution under the same id.
    ///
    /// Terminal executions are rejected without touching their record.
    pub async fn resume_with_options(
        &self,
        execution_id: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionHandle, ExecutionError> {
        let mut state = self.store.load(execution_id).await?;
        if state.is_terminal() {
            return Err(ExecutionError::AlreadyTerminal {
                id: state.execution_id,
                status: state.status,
            });
        }
        if state.reopen() {
            self.store.save(&mut state).await?;
        }

        let message = format!("Resuming workflow execution: {}", state.workflow_name);
        Ok(self.spawn(state, options, message))
    }

    pub async fn get_state(&self, execution_id: &str) -> Result<ExecutionState, ExecutionError> {
        Ok(self.store.load(execution_id).await?)
    }

    pub async fn list_active(&self) -> Result<Vec<ExecutionState>, ExecutionError> {
        Ok(self.store.list_active().await?)
    }

    pub async fn list_all(&self) -> Result<Vec<ExecutionState>, ExecutionError> {
        Ok(self.store.list_all().await?)
    }

    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, ExecutionError> {
        Ok(self.store.cleanup(max_age).await?)
    }

    pub async fn delete(&self, execution_id: &str) -> Result<(), ExecutionError> {
        Ok(self.store.delete(execution_id).await?)
    }

    fn spawn(
        &self,
        state: ExecutionState,
        options: ExecutionOptions,
        message: String,
    ) -> ExecutionHandle {
        let (tx, rx) = mpsc::channel(options.event_buffer.max(1));
        let cancel = self.shutdown.child_token();
        let execution_id = state.execution_id.clone();
        let span = tracing::info_span!("execution", execution_id = %execution_id);

        let run = ExecutionRun {
            backend: Arc::clone(&self.backend),
            store: self.store.clone(),
            runner: state.runner.clone(),
            state,
            options,
            translator: EventTranslator::new(),
            events: tx,
            cancel: cancel.clone(),
        };
        self.tracker.spawn(run.run(message).instrument(span));

        ExecutionHandle {
            execution_id,
            events: rx,
            cancel,
        }
    }
}

/// How the whole execution ended.
enum Outcome {
    /// The server reported a final status
    Finished(ExecutionStatus),
    Failed(ExecutionError),
    Cancelled,
}

/// How a single connection attempt ended.
enum AttemptEnd {
    Finished(ExecutionStatus),
    /// Fatal error frame from the server
    Fatal(String),
    Cancelled,
    /// Transport failure; retried if retryable and budget remains
    Lost(TransportError),
}

/// State owned by one execution task.
struct ExecutionRun<B> {
    backend: Arc<B>,
    store: ExecutionStore,
    runner: String,
    state: ExecutionState,
    options: ExecutionOptions,
    translator: EventTranslator,
    events: mpsc::Sender<ExecutionEvent>,
    cancel: CancellationToken,
}

impl<B: WorkflowBackend> ExecutionRun<B> {
    async fn run(mut self, message: String) {
        tracing::info!("[Executor] {}", message);
        // First into an empty queue: never waits, even when already cancelled.
        let opening = ExecutionEvent::State {
            execution_id: self.state.execution_id.clone(),
            message,
            state: Box::new(self.state.clone()),
        };
        if self.events.send(opening).await.is_err() {
            tracing::debug!("[Executor] Event receiver dropped");
        }

        let outcome = self.retry_loop().await;
        let terminal = self.conclude(outcome).await;

        if self.state.status == ExecutionStatus::Running {
            self.persist_status(ExecutionStatus::Interrupted).await;
        }
        if self.events.send(terminal).await.is_err() {
            tracing::debug!("[Executor] Event receiver dropped before the terminal event");
        }
    }

    async fn retry_loop(&mut self) -> Outcome {
        let policy = self.options.retry_policy();
        let mut retry: u32 = 0;

        loop {
            let err = match self.attempt(retry).await {
                Ok(AttemptEnd::Finished(status)) => return Outcome::Finished(status),
                Ok(AttemptEnd::Fatal(message)) => {
                    return Outcome::Failed(ExecutionError::WorkflowFailed(message))
                }
                Ok(AttemptEnd::Cancelled) => return Outcome::Cancelled,
                Ok(AttemptEnd::Lost(err)) => err,
                Err(store_err) => return Outcome::Failed(store_err.into()),
            };

            if !err.is_retryable() {
                return Outcome::Failed(err.into());
            }

            retry += 1;
            if !policy.allows(retry) {
                return Outcome::Failed(ExecutionError::RetriesExhausted {
                    attempts: retry,
                    last_error: err,
                });
            }

            let delay = policy.delay_for(retry);
            tracing::warn!(
                "[Executor] Connection lost ({}), reconnecting in {:?} (attempt {}/{})",
                err,
                delay,
                retry,
                policy.max_retries
            );
            if let Err(store_err) = self.store.mark_connection_lost(&mut self.state).await {
                return Outcome::Failed(store_err.into());
            }

            let message = err.to_string();
            self.emit(ExecutionEvent::Error {
                execution_id: self.state.execution_id.clone(),
                hint: hint_for(&message),
                message: message.clone(),
                terminal: false,
            })
            .await;
            self.emit(ExecutionEvent::Reconnecting {
                execution_id: self.state.execution_id.clone(),
                attempt: retry,
                max_attempts: policy.max_retries,
                delay_ms: delay.as_millis() as u64,
                reason: message,
            })
            .await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(&mut self, retry: u32) -> Result<AttemptEnd, StoreError> {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(AttemptEnd::Cancelled),
            opened = self.backend.execute(&self.state.original_request, &self.runner) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => return Ok(AttemptEnd::Lost(err)),
        };

        self.store.mark_connection_restored(&mut self.state).await?;
        if retry > 0 {
            tracing::info!("[Executor] Connection restored on attempt {}", retry);
            self.emit(ExecutionEvent::Reconnected {
                execution_id: self.state.execution_id.clone(),
                attempt: retry,
            })
            .await;
        }

        let heartbeat = Heartbeat::start(
            self.options.inactivity_timeout,
            self.options.heartbeat_interval,
        );
        let mut decoder = FrameDecoder::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(AttemptEnd::Cancelled),
                _ = heartbeat.stalled.cancelled() => {
                    return Ok(AttemptEnd::Lost(TransportError::Inactivity(
                        self.options.inactivity_timeout,
                    )))
                }
                next = stream.next() => next,
            };

            let (frames, eof) = match next {
                Some(Ok(chunk)) => (decoder.push(&chunk), false),
                Some(Err(err)) => return Ok(AttemptEnd::Lost(err)),
                None => (decoder.finish(), true),
            };

            for frame in frames {
                heartbeat.touch();
                if let Some(end) = self.handle_frame(frame).await? {
                    return Ok(end);
                }
                if self.cancel.is_cancelled() {
                    return Ok(AttemptEnd::Cancelled);
                }
            }

            if eof {
                return Ok(AttemptEnd::Lost(TransportError::PrematureEnd));
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<Option<AttemptEnd>, StoreError> {
        let events = self.translator.translate(&frame);
        self.state.last_known_event = Some(frame);
        let mut saved = false;

        for event in events {
            match event {
                WorkflowEvent::Data { data } => {
                    self.emit(ExecutionEvent::Data {
                        execution_id: self.state.execution_id.clone(),
                        data,
                    })
                    .await;
                }
                WorkflowEvent::StepStarted { name } | WorkflowEvent::StepRunning { name } => {
                    saved |= self.step(name, StepStatus::Running, None, None).await?;
                }
                WorkflowEvent::StepCompleted { name, output } => {
                    saved |= self.step(name, StepStatus::Completed, output, None).await?;
                }
                WorkflowEvent::StepFailed {
                    name,
                    output,
                    error,
                } => {
                    saved |= self.step(name, StepStatus::Failed, output, error).await?;
                }
                WorkflowEvent::WorkflowCompleted { request_id } => {
                    if request_id.is_some() {
                        self.state.server_request_id = request_id;
                    }
                    return Ok(Some(AttemptEnd::Finished(ExecutionStatus::Completed)));
                }
                WorkflowEvent::WorkflowFailed { request_id, reason } => {
                    if request_id.is_some() {
                        self.state.server_request_id = request_id;
                    }
                    self.state.error = Some(reason);
                    return Ok(Some(AttemptEnd::Finished(ExecutionStatus::Failed)));
                }
                WorkflowEvent::Error {
                    message,
                    fatal: true,
                } => {
                    return Ok(Some(AttemptEnd::Fatal(message)));
                }
                WorkflowEvent::Error {
                    message,
                    fatal: false,
                } => {
                    tracing::warn!("[Executor] Server reported error: {}", message);
                    self.emit(ExecutionEvent::Error {
                        execution_id: self.state.execution_id.clone(),
                        hint: hint_for(&message),
                        message,
                        terminal: false,
                    })
                    .await;
                }
                WorkflowEvent::Done => {
                    tracing::debug!("[Executor] Server signalled end of stream");
                }
            }
        }
        // Keep `lastKnownEvent` current on disk for frames that changed no step.
        if !saved {
            self.store.save(&mut self.state).await?;
        }
        Ok(None)
    }

    /// Persist a step transition and report it. Returns whether the record
    /// was written.
    async fn step(
        &mut self,
        name: String,
        status: StepStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        let saved = self
            .store
            .update_step(&mut self.state, &name, status, output.clone(), error.clone())
            .await?;
        tracing::debug!("[Executor] Step '{}' -> {}", name, status);
        self.emit(ExecutionEvent::Step {
            execution_id: self.state.execution_id.clone(),
            name,
            status,
            output,
            error,
        })
        .await;
        Ok(saved)
    }

    /// Persist the outcome and build the single terminal event.
    async fn conclude(&mut self, outcome: Outcome) -> ExecutionEvent {
        let execution_id = self.state.execution_id.clone();
        match outcome {
            Outcome::Finished(status) => {
                if let Err(e) = self.store.complete(&mut self.state, status).await {
                    tracing::error!("[Executor] Failed to persist final status: {}", e);
                    let message = ExecutionError::from(e).to_string();
                    return ExecutionEvent::Error {
                        execution_id,
                        hint: None,
                        message,
                        terminal: true,
                    };
                }
                tracing::info!(
                    "[Executor] Workflow {}: {}",
                    status,
                    self.state.workflow_name
                );
                ExecutionEvent::Complete {
                    execution_id,
                    status,
                    state: Box::new(self.state.clone()),
                }
            }
            Outcome::Failed(err) => {
                let message = err.to_string();
                tracing::error!("[Executor] Execution failed: {}", message);
                self.state.error = Some(message.clone());
                self.persist_status(ExecutionStatus::Failed).await;
                ExecutionEvent::Error {
                    execution_id,
                    hint: hint_for(&message),
                    message,
                    terminal: true,
                }
            }
            Outcome::Cancelled => {
                tracing::info!("[Executor] Execution cancelled");
                if self.state.status == ExecutionStatus::Running {
                    self.persist_status(ExecutionStatus::Interrupted).await;
                }
                ExecutionEvent::Error {
                    execution_id,
                    hint: None,
                    message: ExecutionError::Cancelled.to_string(),
                    terminal: true,
                }
            }
        }
    }

    async fn persist_status(&mut self, status: ExecutionStatus) {
        if let Err(e) = self.store.complete(&mut self.state, status).await {
            tracing::error!("[Executor] Failed to mark execution {}: {}", status, e);
        }
    }

    /// Queue a non-terminal event. Gives up once the execution is cancelled
    /// so a full, undrained queue cannot hold the task past cancellation.
    async fn emit(&self, event: ExecutionEvent) {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!("[Executor] Dropping event after cancellation");
            }
            sent = self.events.send(event) => {
                if sent.is_err() {
                    tracing::debug!("[Executor] Event receiver dropped");
                }
            }
        }
    }
}

/// An operator hint, when it says more than the message itself.
fn hint_for(message: &str) -> Option<String> {
    let hint = describe_error(message);
    (hint != message).then_some(hint)
}

/// Watchdog for one attempt: cancels `stalled` once no frame has been seen
/// for `timeout`. Stops when dropped.
struct Heartbeat {
    origin: Instant,
    last_frame_ms: Arc<AtomicU64>,
    stalled: CancellationToken,
    _stop: DropGuard,
}

impl Heartbeat {
    fn start(timeout: Duration, interval: Duration) -> Self {
        let origin = Instant::now();
        let last_frame_ms = Arc::new(AtomicU64::new(0));
        let stalled = CancellationToken::new();
        let stop = CancellationToken::new();

        tokio::spawn(
            watch_inactivity(
                origin,
                Arc::clone(&last_frame_ms),
                timeout,
                interval.max(Duration::from_millis(1)),
                stalled.clone(),
                stop.clone(),
            )
            .in_current_span(),
        );

        Self {
            origin,
            last_frame_ms,
            stalled,
            _stop: stop.drop_guard(),
        }
    }

    fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_frame_ms.store(elapsed, Ordering::Relaxed);
    }
}

async fn watch_inactivity(
    origin: Instant,
    last_frame_ms: Arc<AtomicU64>,
    timeout: Duration,
    interval: Duration,
    stalled: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let last = Duration::from_millis(last_frame_ms.load(Ordering::Relaxed));
        let idle = origin.elapsed().saturating_sub(last);
        if idle >= timeout {
            tracing::warn!("[Executor] No frames for {:?}, treating connection as dead", idle);
            stalled.cancel();
            return;
        }
    }
}
