//! CLI front end (§6 "Exit codes (when the orchestrator is a CLI)"). Runs
//! the same runner stack `quorum-server` composes, but in-process and to
//! completion, mapping the terminal `CoreError` to a process exit code.
//! Subcommand/`clap` shape follows `orca.rs`'s `Cli { command: Option<Commands> }`.

use clap::{Parser, Subcommand};
use quorum_core::{CoreError, ErrorCode};
use quorum_phases::runner::AutoContinue;
use quorum_server::runner_builder::{build_blueprint, build_stack};
use quorum_server::{load_config, QuorumConfig};
use quorum_state::{ExecutionMode, StateManager, WorkflowId, WorkflowState};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = ".quorum/config.yaml";
const DEFAULT_BUS_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "Quorum-AI: multi-agent coding workflow orchestrator", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new workflow from a prompt and drive it to completion
    Run {
        /// The task prompt to refine, analyze, plan, and execute
        prompt: String,
        /// Execution mode: single (default), multi, interactive
        #[arg(long, default_value = "single")]
        mode: String,
    },
    /// Resume a persisted, non-terminal workflow and drive it to completion
    Resume {
        /// Workflow id to resume
        workflow_id: String,
    },
    /// Show a workflow's persisted state
    Status {
        /// Workflow id to inspect
        workflow_id: String,
        /// Output format: text (default), json
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// List known workflows
    List {
        /// Output format: text (default), json
        #[arg(long, default_value = "text")]
        format: String,
    },
}

fn parse_execution_mode(mode: &str) -> ExecutionMode {
    match mode {
        "multi" | "multi_agent" => ExecutionMode::MultiAgent,
        "interactive" => ExecutionMode::Interactive,
        _ => ExecutionMode::SingleAgent,
    }
}

fn fail(e: CoreError) -> ! {
    eprintln!("error: {}", e.message);
    exit(e.code.exit_code());
}

fn load_config_or_exit(path: &PathBuf) -> QuorumConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(e) => fail(e),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string())).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { prompt, mode } => run_workflow(&cli.config, prompt, &mode).await,
        Commands::Resume { workflow_id } => resume_workflow(&cli.config, workflow_id).await,
        Commands::Status { workflow_id, format } => show_status(&cli.config, workflow_id, &format).await,
        Commands::List { format } => list_workflows(&cli.config, &format).await,
    }
}

async fn run_workflow(config_path: &PathBuf, prompt: String, mode: &str) {
    let config = load_config_or_exit(config_path);
    let stack = match build_stack(&config, Arc::new(AutoContinue), DEFAULT_BUS_CAPACITY) {
        Ok(stack) => stack,
        Err(e) => fail(e),
    };

    let blueprint = match build_blueprint(&config, parse_execution_mode(mode), &stack.registry) {
        Ok(blueprint) => blueprint,
        Err(e) => fail(e),
    };

    let workflow_id = WorkflowId::generate(chrono::Utc::now().timestamp() as u64);
    println!("starting workflow {workflow_id}");
    let workflow_state = WorkflowState::new(workflow_id, prompt, blueprint);

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    match stack.runner.start(workflow_state, &cancel).await {
        Ok(()) => {
            println!("workflow completed");
            exit(0);
        }
        Err(e) => fail(e),
    }
}

async fn resume_workflow(config_path: &PathBuf, workflow_id: String) {
    let config = load_config_or_exit(config_path);
    let stack = match build_stack(&config, Arc::new(AutoContinue), DEFAULT_BUS_CAPACITY) {
        Ok(stack) => stack,
        Err(e) => fail(e),
    };

    let workflow_id = WorkflowId(workflow_id);
    let cancel = CancellationToken::new();
    let workflow_state = match stack.state_manager.load(&workflow_id, &cancel).await {
        Ok(Some(state)) => state,
        Ok(None) => fail(CoreError::new(ErrorCode::Config, format!("unknown workflow {workflow_id}"))),
        Err(e) => fail(e),
    };

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });

    match stack.runner.resume_with_state(workflow_state, &cancel).await {
        Ok(()) => {
            println!("workflow completed");
            exit(0);
        }
        Err(e) => fail(e),
    }
}

async fn show_status(config_path: &PathBuf, workflow_id: String, format: &str) {
    let config = load_config_or_exit(config_path);
    let state_manager = quorum_server::runner_builder::build_state_manager(&config);
    let cancel = CancellationToken::new();
    let workflow_id = WorkflowId(workflow_id);

    let state = match state_manager.load(&workflow_id, &cancel).await {
        Ok(Some(state)) => state,
        Ok(None) => fail(CoreError::new(ErrorCode::Config, format!("unknown workflow {workflow_id}"))),
        Err(e) => fail(e),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&state).unwrap_or_default());
    } else {
        println!("workflow {} — {:?} (phase: {:?})", state.workflow_id, state.status, state.current_phase);
        for task in state.tasks.values() {
            println!("  task {} [{}] — {:?}", task.id, task.name, task.status);
        }
    }
}

async fn list_workflows(config_path: &PathBuf, format: &str) {
    let config = load_config_or_exit(config_path);
    let state_manager = quorum_server::runner_builder::build_state_manager(&config);
    let cancel = CancellationToken::new();

    let workflows = match state_manager.list_workflows(&cancel).await {
        Ok(workflows) => workflows,
        Err(e) => fail(e),
    };

    if format == "json" {
        let body: Vec<_> =
            workflows.iter().map(|w| serde_json::json!({ "workflow_id": w.workflow_id.0, "status": w.status, "updated_at": w.updated_at })).collect();
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        for w in &workflows {
            println!("{}  {:?}  updated {}", w.workflow_id, w.status, w.updated_at);
        }
    }
}
