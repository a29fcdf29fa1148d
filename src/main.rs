#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # webtunnel
//!
//! Expose a web application running behind NAT through a public relay.
//!
//! The agent dials the relay over one outbound WebSocket; the relay forwards
//! every HTTP request under its tunnel prefix to the agent, which calls the
//! local application and sends the response back.
//!
//! ## Subcommands
//!
//! - `webtunnel relay`: run the public relay
//! - `webtunnel agent`: run the agent next to the local application
//!
//! ## Relay endpoints
//!
//! | Method | Path               | Description                               |
//! |--------|--------------------|-------------------------------------------|
//! | ANY    | `/proxy/*`         | Forwarded to the agent                    |
//! | GET    | `/ws`              | Duplex endpoint for agents and observers  |
//! | GET    | `/health`          | Relay status (agent/observer counts)      |
//! | GET    | `/`, `/status`     | Static pages (when `static_dir` is set)   |
//! | ANY    | anything else      | Redirected into `/proxy/*`                |
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, graceful shutdown
//! config.rs       : TOML + env-var configuration
//! error.rs        : relay failures mapped to HTTP statuses
//! cookies.rs      : cookie records, agent jar, relay attribute rewriting
//! rewrite.rs      : HTML/CSS reference rewriting under the prefix
//! state.rs        : agent session statistics
//! tunnel/
//!   envelope.rs   : JSON message unit
//!   codec.rs      : body encodings
//!   registry.rs   : connected agents and observers
//!   multiplexer.rs: correlation ids, pending table, timeouts
//!   relay.rs      : relay router and duplex endpoint
//!   agent.rs      : agent session, local HTTP executor, liveness endpoint
//! ```

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use webtunnel::config::Config;
use webtunnel::state::AgentStats;
use webtunnel::tunnel::{agent, relay};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reverse HTTP tunnel over a single outbound WebSocket.
#[derive(Parser)]
#[command(name = "webtunnel", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay.
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the agent next to the local application.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Relay { config } => run_relay(config.as_deref()).await,
        Commands::Agent { config } => run_agent(config.as_deref()).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("webtunnel: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Load configuration and initialize tracing from `RUST_LOG` or `logging.level`.
fn init(config_path: Option<&str>) -> Result<Config, BoxError> {
    let config = Config::load(config_path)?;
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    Ok(config)
}

async fn run_relay(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = init(config_path)?;

    info!("webtunnel relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!(prefix = %config.relay.prefix, "Tunnel prefix");
    if config.relay.public_host.is_none() {
        info!("No public_host configured, rewritten cookies will be host-only");
    }

    let state = relay::RelayState::new(config.relay);
    let app = relay::relay_router(state.clone());
    let sweep_task = relay::spawn_sweeper(&state);

    let listener = TcpListener::bind(state.config.listen.as_str()).await?;
    info!("Listening on {}", listener.local_addr()?);

    // Close duplex connections as soon as the signal arrives so the server
    // is not left waiting on them.
    let shutdown_state = state.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Closing tunnel connections...");
        shutdown_state.shutdown().await;
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    if let Some(task) = sweep_task {
        task.abort();
    }
    info!("Goodbye");
    Ok(())
}

async fn run_agent(config_path: Option<&str>) -> Result<(), BoxError> {
    let config = init(config_path)?;

    info!("webtunnel agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(relay = %config.agent.relay_url, local = %config.agent.local_url, "Tunnel endpoints");

    let stats = Arc::new(AgentStats::new());

    let health_task = match &config.agent.health_listen {
        Some(addr) => {
            let listener = TcpListener::bind(addr.as_str()).await?;
            info!("Liveness endpoint on {}", listener.local_addr()?);
            let app = agent::health_router(stats.clone());
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "Liveness server failed");
                }
            }))
        }
        None => None,
    };

    let session = agent::spawn(config.agent, stats.clone());

    shutdown_signal().await;

    info!("Shutting down...");
    session.abort();
    if let Some(task) = health_task {
        task.abort();
    }
    info!(reconnects = stats.reconnects(), "Goodbye");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    () = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM");
                ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await;
        info!("Received SIGINT");
    }
}
