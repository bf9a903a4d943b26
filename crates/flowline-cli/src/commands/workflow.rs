//! `flowline workflow` — run, resume and inspect workflow executions.

use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use console::style;
use flowline_core::{
    ExecutionContext, ExecutionEvent, ExecutionHandle, ExecutionOptions, ExecutionState,
    ExecutionStatus, StepStatus, WorkflowExecutionRequest,
};

use super::{print_json, truncate};

/// Arguments for `flowline workflow run`.
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub file: String,
    pub runner: Option<String>,
    pub vars: Vec<String>,
    pub options: ExecutionOptions,
    pub json: bool,
}

/// Run a workflow definition and follow its events until it ends.
pub async fn run(ctx: &ExecutionContext, args: RunArgs) -> Result<(), String> {
    let mut request =
        WorkflowExecutionRequest::from_file(&args.file).map_err(|e| e.to_string())?;
    for var in &args.vars {
        let (key, value) = parse_var(var)?;
        request.set_variable(key, value);
    }

    if !args.json {
        let runner = args
            .runner
            .as_deref()
            .or(request.runner.as_deref())
            .unwrap_or(ctx.config().default_runner.as_str());
        println!("📄 Loaded workflow: {} ({})", request.name, args.file);
        println!("   {} step(s), runner: {}", request.steps.len(), runner);
        if let Some(step) = &args.options.start_from_step {
            println!("   Starting from step: {}", step);
        }
        println!();
    }

    let handle = ctx
        .executor()
        .start_with_options(&request, args.runner.as_deref(), args.options)
        .await
        .map_err(|e| e.to_string())?;
    follow(handle, args.json).await
}

/// Parse and validate a workflow definition without submitting it.
pub async fn validate(file: &str) -> Result<(), String> {
    let request = WorkflowExecutionRequest::from_file(file).map_err(|e| e.to_string())?;
    println!("✅ Workflow '{}' is valid", request.name);
    if !request.description.is_empty() {
        println!("   {}", request.description);
    }
    for (i, step) in request.steps.iter().enumerate() {
        match &step.description {
            Some(desc) => println!("   {}. {} - {}", i + 1, step.name, desc),
            None => println!("   {}. {}", i + 1, step.name),
        }
    }
    Ok(())
}

/// Resume an interrupted or still-running execution.
pub async fn resume(ctx: &ExecutionContext, execution_id: &str, json: bool) -> Result<(), String> {
    let state = ctx
        .executor()
        .get_state(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    if !json {
        println!("🔄 {}", state.summary());
        if state.connection_lost {
            println!("   Connection was lost after {} retry attempt(s)", state.retry_count);
        }
        println!(
            "   Note: the workflow is re-submitted; steps may run again on the server"
        );
        println!();
    }

    let handle = ctx
        .executor()
        .resume(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    follow(handle, json).await
}

/// List active executions, or every stored execution with `all`.
pub async fn list(ctx: &ExecutionContext, all: bool, json: bool) -> Result<(), String> {
    let executor = ctx.executor();
    let states = if all {
        executor.list_all().await
    } else {
        executor.list_active().await
    }
    .map_err(|e| e.to_string())?;

    if json {
        print_json(&serde_json::to_value(&states).map_err(|e| e.to_string())?);
        return Ok(());
    }

    if states.is_empty() {
        println!(
            "No {}executions found in {}",
            if all { "" } else { "active " },
            ctx.store().state_dir().display()
        );
        return Ok(());
    }

    println!("┌──────────────────────────────────────┬──────────────────────┬─────────────┬─────────┬─────────────────────┐");
    println!("│ ID                                   │ Workflow             │ Status      │ Steps   │ Last update         │");
    println!("├──────────────────────────────────────┼──────────────────────┼─────────────┼─────────┼─────────────────────┤");
    for state in &states {
        let status = if state.connection_lost {
            format!("{}*", state.status)
        } else {
            state.status.to_string()
        };
        println!(
            "│ {:<36} │ {:<20} │ {:<11} │ {:<7} │ {:<19} │",
            truncate(&state.execution_id, 36),
            truncate(&state.workflow_name, 20),
            status,
            format!("{}/{}", state.completed_steps, state.total_steps),
            local_time(state.last_update)
        );
    }
    println!("└──────────────────────────────────────┴──────────────────────┴─────────────┴─────────┴─────────────────────┘");
    if states.iter().any(|s| s.connection_lost) {
        println!("* connection lost");
    }
    Ok(())
}

/// Show the stored state of one execution.
pub async fn status(ctx: &ExecutionContext, execution_id: &str, json: bool) -> Result<(), String> {
    let state = ctx
        .executor()
        .get_state(execution_id)
        .await
        .map_err(|e| e.to_string())?;

    if json {
        print_json(&serde_json::to_value(&state).map_err(|e| e.to_string())?);
        return Ok(());
    }

    for line in describe_state(&state) {
        println!("{}", line);
    }
    Ok(())
}

/// Delete terminal records older than `older_than_hours`.
pub async fn cleanup(ctx: &ExecutionContext, older_than_hours: u64) -> Result<(), String> {
    let max_age = Duration::from_secs(older_than_hours.saturating_mul(3600));
    let removed = ctx
        .executor()
        .cleanup(max_age)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "🧹 Removed {} finished execution record(s) older than {} hour(s)",
        removed, older_than_hours
    );
    Ok(())
}

/// Delete one execution record.
pub async fn delete(ctx: &ExecutionContext, execution_id: &str) -> Result<(), String> {
    ctx.executor()
        .delete(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("🗑  Deleted execution {}", execution_id);
    Ok(())
}

/// Print events until the stream closes; Ctrl-C cancels the execution.
async fn follow(mut handle: ExecutionHandle, json: bool) -> Result<(), String> {
    let cancel = handle.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n⏹  Cancelling, the execution will be saved as interrupted...");
            cancel.cancel();
        }
    });

    let mut result = Err("Execution ended without a final status".to_string());
    while let Some(event) = handle.next_event().await {
        if json {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("[Workflow] Failed to serialize event: {}", e),
            }
        } else if let Some(line) = render_event(&event) {
            println!("{}", line);
        }
        if event.is_terminal() {
            result = terminal_result(&event);
        }
    }

    ctrl_c.abort();
    if handle.cancellation_token().is_cancelled() && !json {
        println!(
            "\n💡 Resume with: flowline workflow resume {}",
            handle.execution_id()
        );
    }
    result
}

/// One display line per event; `None` for events with nothing to show.
pub fn render_event(event: &ExecutionEvent) -> Option<String> {
    match event {
        ExecutionEvent::State {
            execution_id,
            message,
            ..
        } => Some(format!("🚀 {} ({})", message, execution_id)),
        ExecutionEvent::Step {
            name,
            status,
            output,
            error,
            ..
        } => {
            let line = match status {
                StepStatus::Running => format!("▶️  {}", style(name).bold()),
                StepStatus::Completed => format!("✅ {}", style(name).green()),
                StepStatus::Failed => format!(
                    "❌ {}{}",
                    style(name).red(),
                    error
                        .as_deref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                ),
                StepStatus::Skipped => format!("⏭  {}", style(name).dim()),
                StepStatus::Pending => return None,
            };
            match output {
                Some(out) if !out.is_empty() => {
                    Some(format!("{}\n   {}", line, truncate(out.trim(), 500)))
                }
                _ => Some(line),
            }
        }
        ExecutionEvent::Data { data, .. } => Some(format!("   {}", data)),
        ExecutionEvent::Reconnecting {
            attempt,
            max_attempts,
            delay_ms,
            reason,
            ..
        } => Some(format!(
            "🔌 {} - reconnecting in {:.1}s (attempt {}/{})",
            style(reason).yellow(),
            *delay_ms as f64 / 1000.0,
            attempt,
            max_attempts
        )),
        ExecutionEvent::Reconnected { .. } => {
            Some("🔗 Connection restored, resuming workflow monitoring".to_string())
        }
        ExecutionEvent::Error {
            message,
            hint,
            terminal,
            ..
        } => {
            let icon = if *terminal { "💥" } else { "⚠️ " };
            let mut line = format!("{} {}", icon, style(message).red());
            if let Some(hint) = hint {
                line.push_str(&format!("\n   {}", hint));
            }
            Some(line)
        }
        ExecutionEvent::Complete { status, state, .. } => Some(match status {
            ExecutionStatus::Completed => format!(
                "\n🎉 Workflow completed successfully! {}",
                state.summary()
            ),
            _ => format!("\n❌ Workflow {}: {}", status, state.summary()),
        }),
    }
}

fn terminal_result(event: &ExecutionEvent) -> Result<(), String> {
    match event {
        ExecutionEvent::Complete {
            status: ExecutionStatus::Completed,
            ..
        } => Ok(()),
        ExecutionEvent::Complete { status, state, .. } => {
            let failed: Vec<_> = state
                .step_history
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| s.name.clone())
                .collect();
            if failed.is_empty() {
                Err(format!("Workflow {}", status))
            } else {
                Err(format!("Workflow {}. Failed steps: {}", status, failed.join(", ")))
            }
        }
        ExecutionEvent::Error { message, .. } => Err(message.clone()),
        _ => Ok(()),
    }
}

/// Human-readable description of a stored execution.
pub fn describe_state(state: &ExecutionState) -> Vec<String> {
    let mut lines = vec![
        state.summary(),
        format!("   Workflow : {}", state.workflow_name),
        format!("   Runner   : {}", state.runner),
        format!("   Started  : {}", local_time(state.start_time)),
        format!("   Updated  : {}", local_time(state.last_update)),
    ];
    if let Some(end) = state.end_time {
        lines.push(format!("   Ended    : {}", local_time(end)));
    }
    if state.retry_count > 0 {
        lines.push(format!("   Retries  : {}", state.retry_count));
    }
    if let Some(id) = &state.server_request_id {
        lines.push(format!("   Request  : {}", id));
    }
    if let Some(error) = &state.error {
        lines.push(format!("   Error    : {}", error));
    }
    lines.push(String::new());
    for (i, step) in state.step_history.iter().enumerate() {
        let marker = if state.current_step.as_deref() == Some(step.name.as_str()) {
            " ←"
        } else {
            ""
        };
        lines.push(format!(
            "   {}. {:<24} {}{}",
            i + 1,
            truncate(&step.name, 24),
            step.status,
            marker
        ));
        if let Some(error) = &step.error {
            lines.push(format!("      {}", truncate(error, 120)));
        }
    }
    lines
}

/// `KEY=VALUE` → variable; values that parse as JSON keep their type.
pub fn parse_var(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("Invalid variable '{}', expected KEY=VALUE", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid variable '{}', empty key", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn local_time(t: DateTime<Utc>) -> String {
    t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
