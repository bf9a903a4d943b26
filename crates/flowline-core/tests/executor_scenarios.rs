//! End-to-end executor scenarios against a scripted backend.
//!
//! Each scripted attempt either rejects the connection or yields a fixed
//! list of lines followed by a clean end, a transport error, or silence.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};

use flowline_core::client::ByteStream;
use flowline_core::stream::Frame;
use flowline_core::{
    ClientConfig, ExecutionContext, ExecutionError, ExecutionEvent, ExecutionHandle,
    ExecutionOptions, ExecutionStatus, ExecutionStore, StepStatus, TransportError,
    WorkflowBackend, WorkflowExecutionRequest, WorkflowExecutor, WorkflowStep,
};

enum Tail {
    Eof,
    Reset,
    Hang,
}

enum Attempt {
    Stream(Vec<&'static str>, Tail),
    Status(u16),
    Refused,
}

#[derive(Default)]
struct Script {
    attempts: Mutex<VecDeque<Attempt>>,
    requests: Mutex<Vec<WorkflowExecutionRequest>>,
    calls: AtomicUsize,
}

/// Cloneable so a test keeps a view of what the executor submitted.
#[derive(Clone)]
struct ScriptedBackend(Arc<Script>);

impl ScriptedBackend {
    fn new(attempts: Vec<Attempt>) -> Self {
        Self(Arc::new(Script {
            attempts: Mutex::new(attempts.into()),
            ..Default::default()
        }))
    }

    fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<WorkflowExecutionRequest> {
        self.0.requests.lock().unwrap().clone()
    }
}

impl WorkflowBackend for ScriptedBackend {
    async fn execute(
        &self,
        request: &WorkflowExecutionRequest,
        _runner: &str,
    ) -> Result<ByteStream, TransportError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.requests.lock().unwrap().push(request.clone());
        let attempt = self
            .0
            .attempts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Refused);

        match attempt {
            Attempt::Refused => Err(TransportError::Connect("connection refused".into())),
            Attempt::Status(status) => Err(TransportError::Status {
                status,
                body: format!("status {}", status),
            }),
            Attempt::Stream(lines, tail) => {
                let chunks = stream::iter(
                    lines
                        .into_iter()
                        .map(|line| Ok(Bytes::from(format!("{}\n", line))))
                        .collect::<Vec<_>>(),
                );
                Ok(match tail {
                    Tail::Eof => chunks.boxed(),
                    Tail::Reset => chunks
                        .chain(stream::once(async {
                            Err(TransportError::Stream("connection reset".into()))
                        }))
                        .boxed(),
                    Tail::Hang => chunks.chain(stream::pending()).boxed(),
                })
            }
        }
    }
}

const RUNNING_FETCH: &str = r#"2:{"type":"step_running","step":{"name":"fetch"}}"#;
const FETCH_DONE: &str =
    r#"2:{"type":"step_complete","step":{"name":"fetch","status":"finished","output":"cloned"}}"#;
const RUNNING_BUILD: &str = r#"2:{"type":"step_running","step":{"name":"build"}}"#;
const BUILD_DONE: &str =
    r#"2:{"type":"step_complete","step":{"name":"build","status":"finished"}}"#;
const LOG_LINE: &str = "2:plain log";
const WORKFLOW_OK: &str =
    r#"2:{"type":"workflow_complete","status":"finished","success":true,"requestId":"req-42"}"#;

fn request(steps: &[&str]) -> WorkflowExecutionRequest {
    WorkflowExecutionRequest::new("release", steps.iter().map(|s| WorkflowStep::new(*s)).collect())
}

fn fast_retries() -> ExecutionOptions {
    ExecutionOptions::default().with_retry_delay(Duration::from_millis(5))
}

async fn executor(
    attempts: Vec<Attempt>,
) -> (WorkflowExecutor<ScriptedBackend>, ScriptedBackend, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = ExecutionStore::open(dir.path()).await.unwrap();
    let backend = ScriptedBackend::new(attempts);
    (
        WorkflowExecutor::new(backend.clone(), store),
        backend,
        dir,
    )
}

async fn collect(mut handle: ExecutionHandle) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

fn assert_well_formed(events: &[ExecutionEvent]) {
    assert!(matches!(events.first(), Some(ExecutionEvent::State { .. })));
    assert!(events.last().is_some_and(|e| e.is_terminal()));
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
}

/// Poll the stored record until `check` holds, for up to two seconds.
async fn wait_for_state(
    executor: &WorkflowExecutor<ScriptedBackend>,
    id: &str,
    check: impl Fn(&flowline_core::ExecutionState) -> bool,
) -> flowline_core::ExecutionState {
    for _ in 0..200 {
        let state = executor.get_state(id).await.unwrap();
        if check(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("record {} never reached the expected state", id);
}

#[tokio::test]
async fn test_reconnect_after_drop_completes_workflow() {
    let (executor, backend, _dir) = executor(vec![
        Attempt::Stream(vec![RUNNING_FETCH, FETCH_DONE, RUNNING_BUILD], Tail::Reset),
        Attempt::Stream(vec![BUILD_DONE, WORKFLOW_OK], Tail::Eof),
    ])
    .await;

    let handle = executor
        .start_with_options(&request(&["fetch", "build"]), Some("pool-a"), fast_retries())
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    let events = collect(handle).await;

    assert_well_formed(&events);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::Complete {
            status: ExecutionStatus::Completed,
            ..
        })
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::Reconnecting { attempt: 1, .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, ExecutionEvent::Reconnected { attempt: 1, .. })));

    let steps: Vec<(String, StepStatus)> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Step { name, status, .. } => Some((name.clone(), *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            ("fetch".to_string(), StepStatus::Running),
            ("fetch".to_string(), StepStatus::Completed),
            ("build".to_string(), StepStatus::Running),
            ("build".to_string(), StepStatus::Completed),
        ]
    );

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.completed_steps, 2);
    assert_eq!(state.retry_count, 1);
    assert!(!state.connection_lost);
    assert_eq!(state.server_request_id.as_deref(), Some("req-42"));
    assert_eq!(state.step("fetch").unwrap().output.as_deref(), Some("cloned"));
    let history: Vec<_> = state
        .step_history
        .iter()
        .map(|s| (s.name.as_str(), s.status))
        .collect();
    assert_eq!(
        history,
        vec![("fetch", StepStatus::Completed), ("build", StepStatus::Completed)]
    );

    assert_eq!(backend.calls(), 2);
    let requests = backend.requests();
    assert_eq!(requests[0], requests[1]);
}

#[tokio::test]
async fn test_terminal_status_is_not_retried() {
    let (executor, backend, _dir) = executor(vec![Attempt::Status(401)]).await;

    let handle = executor
        .start_with_options(&request(&["fetch"]), None, fast_retries())
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    let events = collect(handle).await;

    assert_well_formed(&events);
    match events.last() {
        Some(ExecutionEvent::Error {
            message, terminal, ..
        }) => {
            assert!(*terminal);
            assert!(message.contains("401"), "{message}");
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert_eq!(backend.calls(), 1);

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(state.retry_count, 0);
    assert!(state.error.is_some());
}

#[tokio::test]
async fn test_retry_budget_exhaustion_fails_execution() {
    let (executor, backend, _dir) = executor(vec![]).await;

    let handle = executor
        .start_with_options(&request(&["fetch"]), None, fast_retries().with_max_retries(2))
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    let events = collect(handle).await;

    assert_well_formed(&events);
    let non_terminal_errors = events
        .iter()
        .filter(|e| matches!(e, ExecutionEvent::Error { terminal: false, .. }))
        .count();
    assert_eq!(non_terminal_errors, 2);
    match events.last() {
        Some(ExecutionEvent::Error { message, hint, .. }) => {
            assert!(message.contains("after 3 attempts"), "{message}");
            assert!(hint.as_deref().unwrap().starts_with("Service unavailable"));
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert_eq!(backend.calls(), 3);

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    assert_eq!(state.retry_count, 2);
}

#[tokio::test]
async fn test_no_retry_makes_a_single_attempt() {
    let (executor, backend, _dir) =
        executor(vec![Attempt::Stream(vec![RUNNING_FETCH], Tail::Reset)]).await;

    let handle = executor
        .start_with_options(
            &request(&["fetch"]),
            None,
            ExecutionOptions::default().without_retries(),
        )
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    let terminal = handle.wait().await;

    assert!(matches!(terminal, Some(ExecutionEvent::Error { terminal: true, .. })));
    assert_eq!(backend.calls(), 1);
    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_silent_stream_is_treated_as_dead() {
    let (executor, backend, _dir) = executor(vec![
        Attempt::Stream(vec![RUNNING_FETCH], Tail::Hang),
        Attempt::Stream(vec![FETCH_DONE, WORKFLOW_OK], Tail::Eof),
    ])
    .await;

    let handle = executor.start(&request(&["fetch"]), None).await.unwrap();
    let id = handle.execution_id().to_string();
    let events = collect(handle).await;

    assert_well_formed(&events);
    let reason = events
        .iter()
        .find_map(|e| match e {
            ExecutionEvent::Reconnecting { reason, delay_ms, .. } => {
                assert_eq!(*delay_ms, 2000);
                Some(reason.clone())
            }
            _ => None,
        })
        .expect("a reconnect");
    assert!(reason.contains("No frames received"), "{reason}");
    assert_eq!(backend.calls(), 2);

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.retry_count, 1);
}

#[tokio::test]
async fn test_premature_end_of_stream_reconnects() {
    let (executor, backend, _dir) = executor(vec![
        Attempt::Stream(vec![RUNNING_FETCH, "d:{}"], Tail::Eof),
        Attempt::Stream(vec![FETCH_DONE, WORKFLOW_OK], Tail::Eof),
    ])
    .await;

    let handle = executor
        .start_with_options(&request(&["fetch"]), None, fast_retries())
        .await
        .unwrap();
    let terminal = handle.wait().await;

    assert!(matches!(terminal, Some(ExecutionEvent::Complete { .. })));
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_cancellation_interrupts_and_resume_continues_same_record() {
    let (executor, backend, _dir) = executor(vec![
        Attempt::Stream(vec![RUNNING_FETCH], Tail::Hang),
        Attempt::Stream(vec![FETCH_DONE, WORKFLOW_OK], Tail::Eof),
    ])
    .await;

    let mut handle = executor.start(&request(&["fetch"]), None).await.unwrap();
    let id = handle.execution_id().to_string();
    loop {
        match handle.next_event().await {
            Some(ExecutionEvent::Step { .. }) => break,
            Some(_) => continue,
            None => panic!("stream closed before the first step"),
        }
    }
    handle.cancel();
    match handle.wait().await {
        Some(ExecutionEvent::Error {
            message, terminal, ..
        }) => {
            assert!(terminal);
            assert_eq!(message, "Execution cancelled");
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Interrupted);
    assert_eq!(state.current_step.as_deref(), Some("fetch"));
    assert_eq!(executor.list_active().await.unwrap().len(), 0);

    let resumed = executor.resume(&id).await.unwrap();
    assert_eq!(resumed.execution_id(), id);
    let events = collect(resumed).await;
    assert_well_formed(&events);
    match &events[0] {
        ExecutionEvent::State { message, .. } => assert!(message.starts_with("Resuming")),
        other => panic!("unexpected first event: {:?}", other),
    }

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Completed);
    assert_eq!(state.completed_steps, 1);
    assert_eq!(backend.calls(), 2);
    assert_eq!(executor.list_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_resume_rejects_terminal_execution_without_mutation() {
    let (executor, backend, dir) = executor(vec![]).await;
    let store = executor.store();
    let mut state = store.create(&request(&["fetch"]), "default").await.unwrap();
    store
        .complete(&mut state, ExecutionStatus::Completed)
        .await
        .unwrap();

    let path = dir.path().join(format!("{}.json", state.execution_id));
    let before = std::fs::read(&path).unwrap();

    match executor.resume(&state.execution_id).await {
        Err(ExecutionError::AlreadyTerminal { status, .. }) => {
            assert_eq!(status, ExecutionStatus::Completed)
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("resume of a completed execution must fail"),
    }

    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(backend.calls(), 0);
}

#[tokio::test]
async fn test_start_from_step_submits_remaining_steps() {
    let (executor, backend, _dir) = executor(vec![Attempt::Stream(
        vec![
            r#"2:{"type":"step_running","step":{"name":"build"}}"#,
            BUILD_DONE,
            r#"2:{"type":"step_complete","step":{"name":"test","status":"finished"}}"#,
            WORKFLOW_OK,
        ],
        Tail::Eof,
    )])
    .await;

    let handle = executor
        .start_with_options(
            &request(&["fetch", "build", "test"]),
            None,
            ExecutionOptions::default().starting_from("build"),
        )
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    let terminal = handle.wait().await;
    assert!(matches!(terminal, Some(ExecutionEvent::Complete { .. })));

    let submitted = backend.requests()[0].clone();
    assert_eq!(submitted.name, "release (from step build)");
    let names: Vec<_> = submitted.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["build", "test"]);

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.total_steps, 2);
    assert_eq!(state.completed_steps, 2);
    assert_eq!(state.step("fetch").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn test_start_from_unknown_step_creates_nothing() {
    let (executor, _backend, _dir) = executor(vec![]).await;
    let result = executor
        .start_with_options(
            &request(&["fetch"]),
            None,
            ExecutionOptions::default().starting_from("deploy"),
        )
        .await;
    assert!(matches!(result, Err(ExecutionError::StepNotFound(_))));
    assert!(executor.list_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fatal_error_frame_ends_run() {
    let (executor, backend, _dir) = executor(vec![Attempt::Stream(
        vec![RUNNING_FETCH, r#"e:"rpc error: context deadline exceeded""#, FETCH_DONE],
        Tail::Eof,
    )])
    .await;

    let handle = executor
        .start_with_options(&request(&["fetch"]), None, fast_retries())
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    match handle.wait().await {
        Some(ExecutionEvent::Error { hint, terminal, .. }) => {
            assert!(terminal);
            assert!(hint.unwrap().starts_with("Connection timeout"));
        }
        other => panic!("unexpected terminal event: {:?}", other),
    }
    assert_eq!(backend.calls(), 1);

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
    // frames after the fatal error are not applied
    assert_eq!(state.step("fetch").unwrap().status, StepStatus::Running);
}

#[tokio::test]
async fn test_warning_frame_does_not_end_run() {
    let (executor, _backend, _dir) = executor(vec![Attempt::Stream(
        vec![
            r#"e:"disk usage at 91%""#,
            "Cloning into 'repo'...",
            "data: plain log line",
            r#"2:{"type":"workflow_complete","status":"finished","success":false}"#,
        ],
        Tail::Eof,
    )])
    .await;

    let handle = executor.start(&request(&["fetch"]), None).await.unwrap();
    let id = handle.execution_id().to_string();
    let events = collect(handle).await;

    assert_well_formed(&events);
    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::Error { terminal: false, message, .. } if message == "disk usage at 91%"
    )));
    let data: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::Data { data, .. } => Some(data.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(data, vec!["plain log line"]);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::Complete {
            status: ExecutionStatus::Failed,
            ..
        })
    ));
    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_context_close_interrupts_running_executions() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ScriptedBackend::new(vec![Attempt::Stream(vec![RUNNING_FETCH], Tail::Hang)]);
    let config = ClientConfig::new("http://unused.invalid").with_state_dir(dir.path());
    let ctx = ExecutionContext::open_with_backend(config, backend)
        .await
        .unwrap();

    let mut handle = ctx.executor().start(&request(&["fetch"]), None).await.unwrap();
    let id = handle.execution_id().to_string();
    while let Some(event) = handle.next_event().await {
        if matches!(event, ExecutionEvent::Step { .. }) {
            break;
        }
    }

    ctx.close().await;
    assert!(matches!(
        handle.wait().await,
        Some(ExecutionEvent::Error { terminal: true, .. })
    ));

    let store = ExecutionStore::open(dir.path()).await.unwrap();
    assert_eq!(
        store.load(&id).await.unwrap().status,
        ExecutionStatus::Interrupted
    );
}

#[tokio::test]
async fn test_cancel_with_full_undrained_queue_still_interrupts() {
    let (executor, _backend, _dir) =
        executor(vec![Attempt::Stream(vec![LOG_LINE; 20], Tail::Hang)]).await;
    let options = ExecutionOptions {
        event_buffer: 1,
        ..ExecutionOptions::default()
    };

    let handle = executor
        .start_with_options(&request(&["fetch"]), None, options)
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.cancel();

    let state = wait_for_state(&executor, &id, |s| s.status != ExecutionStatus::Running).await;
    assert_eq!(state.status, ExecutionStatus::Interrupted);

    let events = collect(handle).await;
    assert_well_formed(&events);
    assert!(matches!(
        events.last(),
        Some(ExecutionEvent::Error { message, terminal: true, .. }) if message == "Execution cancelled"
    ));
}

#[tokio::test]
async fn test_resume_clears_stale_connection_lost_flag() {
    let (executor, backend, _dir) =
        executor(vec![Attempt::Stream(vec![RUNNING_FETCH], Tail::Hang)]).await;
    let store = executor.store();
    let mut state = store.create(&request(&["fetch"]), "pool-a").await.unwrap();
    store.mark_connection_lost(&mut state).await.unwrap();
    store
        .complete(&mut state, ExecutionStatus::Interrupted)
        .await
        .unwrap();
    assert!(store.load(&state.execution_id).await.unwrap().connection_lost);

    let mut handle = executor.resume(&state.execution_id).await.unwrap();
    let mut saw_reconnected = false;
    loop {
        match handle.next_event().await {
            Some(ExecutionEvent::Step { .. }) => break,
            Some(ExecutionEvent::Reconnected { .. }) => saw_reconnected = true,
            Some(_) => continue,
            None => panic!("stream closed before the first step"),
        }
    }
    assert!(!saw_reconnected);

    let streaming = executor.get_state(&state.execution_id).await.unwrap();
    assert_eq!(streaming.status, ExecutionStatus::Running);
    assert!(!streaming.connection_lost);
    assert_eq!(streaming.retry_count, 1);
    assert_eq!(backend.calls(), 1);

    handle.cancel();
    handle.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_stops_retrying() {
    let (executor, backend, _dir) = executor(vec![Attempt::Refused]).await;
    let options = ExecutionOptions::default().with_retry_delay(Duration::from_secs(60));

    let mut handle = executor
        .start_with_options(&request(&["fetch"]), None, options)
        .await
        .unwrap();
    let id = handle.execution_id().to_string();
    loop {
        match handle.next_event().await {
            Some(ExecutionEvent::Reconnecting { delay_ms, .. }) => {
                // 60s base, capped at the 30s default maximum
                assert_eq!(delay_ms, 30_000);
                break;
            }
            Some(_) => continue,
            None => panic!("stream closed before backing off"),
        }
    }
    handle.cancel();

    let events = collect(handle).await;
    let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(matches!(
        terminals[0],
        ExecutionEvent::Error { message, terminal: true, .. } if message == "Execution cancelled"
    ));

    let state = executor.get_state(&id).await.unwrap();
    assert_eq!(state.status, ExecutionStatus::Interrupted);
    assert_eq!(state.retry_count, 1);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_plain_data_frames_update_last_known_event_on_disk() {
    let (executor, _backend, _dir) =
        executor(vec![Attempt::Stream(vec![RUNNING_FETCH, LOG_LINE], Tail::Hang)]).await;

    let mut handle = executor.start(&request(&["fetch"]), None).await.unwrap();
    let id = handle.execution_id().to_string();
    loop {
        match handle.next_event().await {
            Some(ExecutionEvent::Data { data, .. }) => {
                assert_eq!(data, "plain log");
                break;
            }
            Some(_) => continue,
            None => panic!("stream closed before the log line"),
        }
    }

    let state = wait_for_state(&executor, &id, |s| {
        s.last_known_event == Some(Frame::tagged('2', "plain log"))
    })
    .await;
    assert_eq!(state.status, ExecutionStatus::Running);

    handle.cancel();
    handle.wait().await;
}
