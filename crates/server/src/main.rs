//! cdev daemon
//!
//! Local control plane bridging a developer workstation to a mobile
//! client: supervises coding-agent subprocesses, streams their output to
//! WebSocket subscribers, brokers permission prompts, watches the
//! repository and serves a searchable file index - all on one port.

mod config;
mod error;
mod git;
mod http;
mod hub;
mod images;
mod indexer;
mod logging;
mod middleware;
mod origin;
mod pairing;
mod paths;
mod patterns;
mod permissions;
mod ratelimit;
mod registry;
mod rpc;
mod sessions;
mod state;
mod tokens;
mod watcher;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use clap::{Parser, Subcommand};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::logging::init_logging;
use crate::state::{Daemon, SharedState};

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(
    name = "cdev",
    about = "cdev - local control plane for AI coding agents",
    version = VERSION,
)]
struct Cli {
    /// Data directory (default: ~/.cdev)
    #[arg(long, global = true, env = "CDEV_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Config file (default: <data_dir>/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon (default when no subcommand given)
    Start {
        /// Repository to serve
        #[arg(long, env = "CDEV_REPO")]
        repo: Option<PathBuf>,

        /// Bind host
        #[arg(long, env = "CDEV_HOST")]
        host: Option<String>,

        /// Bind port
        #[arg(long, env = "CDEV_PORT")]
        port: Option<u16>,

        /// Public base URL (wss URL is derived from it)
        #[arg(long, env = "CDEV_EXTERNAL_URL")]
        external_url: Option<String>,

        /// Run the agent with pipes only (no PTY)
        #[arg(long)]
        headless: bool,
    },

    /// Check whether a daemon is running for this data dir
    Status,

    /// Write a default config.yaml and print hook setup instructions
    Init,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Some(Command::Status) => return cmd_status(),
        Some(Command::Init) => return cmd_init(&data_dir),
        _ => {}
    }

    let (repo, host, port, external_url, headless) = match cli.command {
        Some(Command::Start {
            repo,
            host,
            port,
            external_url,
            headless,
        }) => (repo, host, port, external_url, headless),
        _ => (None, None, None, None, false),
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("cdev: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let config_path = cli.config.unwrap_or_else(paths::config_path);
    runtime.block_on(async_main(config_path, repo, host, port, external_url, headless))
}

#[allow(clippy::too_many_arguments)]
async fn async_main(
    config_path: PathBuf,
    repo: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    external_url: Option<String>,
    headless: bool,
) -> ExitCode {
    // Everything up to the successful bind is a startup failure (exit 1);
    // errors after that are operational (exit 2).
    let (state, listener, _log_guard, watcher_handle) =
        match startup(config_path, repo, host, port, external_url, headless).await {
            Ok(parts) => parts,
            Err(e) => {
                eprintln!("cdev: startup failed: {e:#}");
                return ExitCode::from(1);
            }
        };

    let app = build_router(state.clone());
    write_pid_file();

    let shutdown_state = state.clone();
    let serve_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // Shutdown order: running operations were cancelled by the signal,
    // the listener is closed; now stop the hub, then the indexer.
    let _ = shutdown_state.sessions.stop().await;
    watcher_handle.shutdown().await;
    shutdown_state.hub.stop();
    shutdown_state.indexer.close();
    remove_pid_file();

    match serve_result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cdev: server aborted: {e}");
            ExitCode::from(2)
        }
    }
}

async fn startup(
    config_path: PathBuf,
    repo: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    external_url: Option<String>,
    headless: bool,
) -> anyhow::Result<(
    SharedState,
    tokio::net::TcpListener,
    logging::LoggingHandle,
    watcher::WatcherHandle,
)> {
    paths::ensure_dirs()?;
    let logging = init_logging()?;
    let root_span = tracing::info_span!("cdev", service = "cdev", run_id = %logging.run_id);
    let _enter = root_span.enter();

    let mut config = Config::load(&config_path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(url) = external_url {
        config.server.external_url = Some(url);
    }
    if headless {
        config.claude.headless = true;
    }
    let repo = repo.unwrap_or(std::env::current_dir()?);

    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        pid = std::process::id(),
        repo = %repo.display(),
        "Starting cdev daemon"
    );

    let state = Daemon::build(config, repo)?;
    spawn_background_tasks(&state);

    let watcher_handle = watcher::start_watcher(
        state.repo.clone(),
        state.workspace_id.clone(),
        state.config.watcher.clone(),
        state.hub.clone(),
        state.indexer.clone(),
        state.git.clone(),
    )?;

    // Initial index population runs in the background; queries served
    // before it completes just see fewer rows.
    {
        let indexer = state.indexer.clone();
        tokio::spawn(async move {
            if let Err(e) = indexer.full_scan().await {
                warn!(
                    component = "indexer",
                    event = "indexer.initial_scan_failed",
                    error = %e,
                    "Initial scan failed"
                );
            }
        });
    }

    let bind_addr = state.config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %bind_addr,
        ws_url = %state.config.server.ws_url(),
        "Listening for connections"
    );

    Ok((state, listener, logging, watcher_handle))
}

fn build_router(state: SharedState) -> Router {
    // Layer order (outermost first): recovery, request id, trace, rate
    // limit, CORS, auth. Axum wraps layers inside-out, so auth attaches
    // first.
    Router::new()
        .route("/health", get(http::health))
        .route("/pair", get(http::pair_page))
        .route("/ws", get(websocket::ws_handler))
        .route("/api/status", get(http::status))
        .route("/api/claude/run", post(http::claude_run))
        .route("/api/claude/stop", post(http::claude_stop))
        .route("/api/claude/respond", post(http::claude_respond))
        .route("/api/claude/sessions", get(http::claude_sessions))
        .route("/api/claude/permissions", get(http::permissions_pending))
        .route("/api/claude/permissions/respond", post(http::permission_respond))
        .route("/api/file", get(http::get_file))
        .route("/api/git/status", get(http::git_status))
        .route("/api/git/diff", get(http::git_diff))
        .route("/api/pair/info", post(http::pair_info))
        .route("/api/pair/exchange", post(http::pair_exchange))
        .route("/api/pair/refresh", post(http::pair_refresh))
        .route("/api/pair/approve", post(http::pair_approve))
        .route("/api/pair/reject", post(http::pair_reject))
        .route("/api/auth/reset", post(http::auth_reset))
        .route("/api/hooks/permission-request", post(http::hook_permission_request))
        .route("/api/index/search", get(http::index_search))
        .route("/api/index/files", get(http::index_files))
        .route("/api/index/tree", get(http::index_tree))
        .route("/api/index/stats", get(http::index_stats))
        .route("/api/index/rescan", post(http::index_rescan))
        .route("/api/images", post(http::image_upload))
        .route("/api/images/{id}", get(http::image_get))
        .route("/api/images/{id}", delete(http::image_delete))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

fn spawn_background_tasks(state: &SharedState) {
    // Revocation sweep
    {
        let tokens = state.tokens.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                tokens.sweep_revoked();
            }
        });
    }

    // Rate limiter idle-key sweep
    {
        let limiter = state.limiter.clone();
        let window = Duration::from_secs(state.config.security.rate_limit.window_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            loop {
                interval.tick().await;
                limiter.sweep();
            }
        });
    }

    // Permission session-memory sweep
    {
        let bridge = state.bridge.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                bridge.sweep_idle_sessions();
            }
        });
    }

    // Expired image sweep
    {
        let images = state.images.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(600));
            loop {
                interval.tick().await;
                images.sweep_all();
            }
        });
    }

    // Registry pruning
    {
        let registry = state.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                if let Err(e) = registry.prune_expired(chrono::Utc::now()) {
                    warn!(
                        component = "registry",
                        event = "registry.prune_failed",
                        error = %e,
                        "Registry prune failed"
                    );
                }
            }
        });
    }

    // Session-end cleanup: cancel pending permission prompts so blocked
    // hooks fall back to the agent UI instead of waiting out the timeout.
    {
        let bridge = state.bridge.clone();
        let subscription = state.hub.subscribe(crate::hub::EventFilter {
            kinds: Some(std::collections::HashSet::from(["claude_status".to_string()])),
            workspace_id: None,
        });
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let cdev_protocol::EventKind::ClaudeStatus {
                    session_id,
                    state: cdev_protocol::SessionState::Exited,
                    ..
                } = &event.payload
                {
                    bridge.cancel_session(session_id);
                }
            }
        });
    }

    // Index reconciliation: heal missed watcher events.
    {
        let indexer = state.indexer.clone();
        let interval_secs = state.config.indexer.reconcile_interval_secs.max(60);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await; // skip the immediate tick
            loop {
                interval.tick().await;
                if let Err(e) = indexer.full_scan().await {
                    warn!(
                        component = "indexer",
                        event = "indexer.reconcile_failed",
                        error = %e,
                        "Reconciliation scan failed"
                    );
                }
            }
        });
    }
}

/// Resolves when SIGINT or SIGTERM arrives. SIGHUP is reserved.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(
                component = "server",
                event = "server.signal_setup_failed",
                error = %e,
                "Cannot listen for SIGTERM"
            );
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
    info!(
        component = "server",
        event = "server.shutdown",
        "Shutdown signal received"
    );
}

fn write_pid_file() {
    let pid_path = paths::pid_file_path();
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(
            component = "server",
            event = "server.pid_file.write_error",
            path = %pid_path.display(),
            error = %e,
            "Failed to write PID file"
        );
    }
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(paths::pid_file_path());
}

fn cmd_status() -> ExitCode {
    let pid_path = paths::pid_file_path();
    match std::fs::read_to_string(&pid_path) {
        Ok(pid) => {
            println!("cdev appears to be running (pid {})", pid.trim());
            ExitCode::SUCCESS
        }
        Err(_) => {
            println!("cdev is not running (no pid file at {})", pid_path.display());
            ExitCode::from(1)
        }
    }
}

fn cmd_init(data_dir: &std::path::Path) -> ExitCode {
    if let Err(e) = paths::ensure_dirs() {
        eprintln!("cdev: cannot create {}: {e}", data_dir.display());
        return ExitCode::from(1);
    }
    let config_path = paths::config_path();
    if !config_path.exists() {
        let default = match serde_yaml::to_string(&Config::default()) {
            Ok(yaml) => yaml,
            Err(e) => {
                eprintln!("cdev: cannot serialize default config: {e}");
                return ExitCode::from(1);
            }
        };
        if let Err(e) = std::fs::write(&config_path, default) {
            eprintln!("cdev: cannot write {}: {e}", config_path.display());
            return ExitCode::from(1);
        }
        println!("wrote {}", config_path.display());
    } else {
        println!("{} already exists, leaving it alone", config_path.display());
    }

    println!();
    println!("To route agent permission prompts through cdev, configure the");
    println!("agent's PreToolUse hook to run `cdev-hook` with:");
    println!("  CDEV_SERVER_URL=http://127.0.0.1:8787");
    println!("  CDEV_HOOK_TOKEN=<access token from pairing>");
    ExitCode::SUCCESS
}
