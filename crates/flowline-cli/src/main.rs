//! flowline CLI — submit workflows to a remote Backend API and follow their
//! progress, surviving dropped connections and process restarts.

use std::time::Duration;

use clap::{Parser, Subcommand};
use flowline_cli::commands;
use flowline_core::{ClientConfig, ExecutionOptions};

/// flowline — resilient workflow execution client
#[derive(Parser)]
#[command(name = "flowline", version, about = "flowline — resilient workflow execution client")]
pub struct Cli {
    /// Backend API root
    #[arg(long, env = "FLOWLINE_BASE_URL", default_value = "http://127.0.0.1:8080/api/v1")]
    base_url: String,

    /// API key sent as `Authorization: UserKey <key>`
    #[arg(long, env = "FLOWLINE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Runner used when neither the command nor the workflow names one
    #[arg(long, env = "FLOWLINE_DEFAULT_RUNNER", default_value = "default")]
    default_runner: String,

    /// Directory holding execution state records
    #[arg(long, env = "FLOWLINE_STATE_DIR")]
    state_dir: Option<String>,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run and manage workflow executions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Submit a workflow and follow it until it finishes
    Run {
        /// Path to the workflow YAML/JSON file
        file: String,
        /// Runner to execute on
        #[arg(long)]
        runner: Option<String>,
        /// Fail on the first connection loss instead of reconnecting
        #[arg(long)]
        no_retry: bool,
        /// Maximum reconnect attempts
        #[arg(long, default_value_t = 10)]
        max_retries: u32,
        /// Base reconnect delay in seconds (doubles per attempt)
        #[arg(long, default_value_t = 2)]
        retry_delay: u64,
        /// Reconnect when no frame arrives for this many seconds
        #[arg(long, default_value_t = 300)]
        inactivity_timeout: u64,
        /// Skip the steps declared before this one
        #[arg(long)]
        from_step: Option<String>,
        /// Workflow variable, KEY=VALUE (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Resume an interrupted execution
    Resume {
        execution_id: String,
        #[arg(long)]
        json: bool,
    },
    /// List executions (active only unless --all)
    List {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        json: bool,
    },
    /// Show one execution's stored state
    Status {
        execution_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Delete finished execution records
    Cleanup {
        /// Only records older than this many hours
        #[arg(long, default_value_t = 168)]
        older_than_hours: u64,
    },
    /// Delete one execution record
    Delete { execution_id: String },
    /// Validate a workflow file without executing it
    Validate { file: String },
}

#[tokio::main]
async fn main() {
    let dotenv_files = commands::load_dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "flowline_core=debug,flowline_cli=debug"
    } else {
        "flowline_core=warn,flowline_cli=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
    for file in dotenv_files {
        tracing::debug!("[CLI] Loaded environment from {}", file);
    }

    let Some(Commands::Workflow { action }) = cli.command else {
        use clap::CommandFactory;
        Cli::command().print_help().ok();
        println!();
        return;
    };

    let mut config = ClientConfig::new(cli.base_url).with_default_runner(cli.default_runner);
    if let Some(key) = cli.api_key.filter(|k| !k.is_empty()) {
        config = config.with_api_key(key);
    }
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }

    let result = match action {
        WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
        action => match commands::init_context(config).await {
            Ok(ctx) => {
                let result = dispatch(&ctx, action).await;
                ctx.close().await;
                result
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(ctx: &flowline_core::ExecutionContext, action: WorkflowAction) -> Result<(), String> {
    match action {
        WorkflowAction::Run {
            file,
            runner,
            no_retry,
            max_retries,
            retry_delay,
            inactivity_timeout,
            from_step,
            vars,
            json,
        } => {
            let mut options = ExecutionOptions::default()
                .with_max_retries(max_retries)
                .with_retry_delay(Duration::from_secs(retry_delay))
                .with_inactivity_timeout(Duration::from_secs(inactivity_timeout));
            if no_retry {
                options = options.without_retries();
            }
            if let Some(step) = from_step {
                options = options.starting_from(step);
            }
            let args = commands::workflow::RunArgs {
                file,
                runner,
                vars,
                options,
                json,
            };
            commands::workflow::run(ctx, args).await
        }
        WorkflowAction::Resume { execution_id, json } => {
            commands::workflow::resume(ctx, &execution_id, json).await
        }
        WorkflowAction::List { all, json } => commands::workflow::list(ctx, all, json).await,
        WorkflowAction::Status { execution_id, json } => {
            commands::workflow::status(ctx, &execution_id, json).await
        }
        WorkflowAction::Cleanup { older_than_hours } => {
            commands::workflow::cleanup(ctx, older_than_hours).await
        }
        WorkflowAction::Delete { execution_id } => {
            commands::workflow::delete(ctx, &execution_id).await
        }
        WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
    }
}
