//! Server binary: loads config, composes the runner stack, runs a startup
//! recovery scan, then serves the HTTP/SSE API (§4.G.4, §4.H, §4.I).
//! Composition mirrors `orchestrator-server.rs`'s config-load /
//! build-router / bind+serve-with-graceful-shutdown shape.

use quorum_phases::runner::AutoContinue;
use quorum_server::api::{build_router, AppState};
use quorum_server::runner_builder::build_stack;
use quorum_server::{load_config, RecoveryManager};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

const DEFAULT_BUS_CAPACITY: usize = 1024;
const RECOVERY_STALE_MINUTES: i64 = 5;

#[tokio::main]
async fn main() {
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(rust_log).init();

    let config_path = std::env::var("QUORUM_CONFIG").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("quorum.yaml"));

    tracing::info!(path = %config_path.display(), "loading configuration");
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            exit(e.code.exit_code());
        }
    };

    let stack = match build_stack(&config, Arc::new(AutoContinue), DEFAULT_BUS_CAPACITY) {
        Ok(stack) => stack,
        Err(e) => {
            tracing::error!(error = %e, "failed to compose runner stack");
            exit(e.code.exit_code());
        }
    };

    tracing::info!("scanning for workflows abandoned by a previous process");
    let recovery = RecoveryManager::new(
        stack.state_manager.clone(),
        stack.git.clone(),
        stack.bus.clone(),
        chrono::Duration::minutes(RECOVERY_STALE_MINUTES),
    );
    match recovery.scan_and_recover(&tokio_util::sync::CancellationToken::new()).await {
        Ok(reports) if !reports.is_empty() => {
            for report in &reports {
                tracing::info!(
                    workflow_id = %report.workflow_id,
                    reset_tasks = report.reset_tasks,
                    stashed_worktrees = report.stashed_worktrees,
                    "recovered abandoned workflow"
                );
            }
        }
        Ok(_) => tracing::info!("no abandoned workflows found"),
        Err(e) => tracing::warn!(error = %e, "recovery scan failed, continuing startup"),
    }

    let host = config.server.host.clone();
    let port = config.server.port;
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, host = %host, port, "invalid server.host/server.port");
            exit(2);
        }
    };

    let state = Arc::new(AppState::new(config, stack));
    let app = build_router(state);

    tracing::info!(%addr, "starting quorum-server");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind listener");
            exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(shutdown_signal()).await {
        tracing::error!(error = %e, "server exited with error");
        exit(1);
    }

    tracing::info!("quorum-server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received CTRL-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
