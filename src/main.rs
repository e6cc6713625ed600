//! telemetry-web - the web console of a vehicle telemetry unit.
//!
//! Serves the built-in pages, the `/ws` live-update socket, and the embedded
//! browser assets until Ctrl+C.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser as ClapParser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemetry_web::{
    api,
    config::{ConfigError, UserConfig, WebConfig},
    housekeeping::Housekeeping,
    server::{Collaborators, WebServer},
    shutdown::ShutdownCoordinator,
};

/// telemetry-web - vehicle telemetry web console
#[derive(ClapParser, Debug)]
#[command(name = "telemetry-web", version, about, long_about = None)]
struct Cli {
    /// Address to bind the HTTP/WebSocket server (overrides the config file)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Path to the TOML config file
    #[arg(long, env = "TELEMETRY_WEB_CONFIG")]
    config: Option<PathBuf>,

    /// Extra login user (requires --password)
    #[arg(long, env = "TELEMETRY_WEB_USER", requires = "password")]
    user: Option<String>,

    /// Password for --user
    #[arg(long, env = "TELEMETRY_WEB_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid bind address {0:?}")]
    Bind(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(&cli)?;
    let bind: SocketAddr = match cli.bind {
        Some(addr) => addr,
        None => config
            .bind
            .parse()
            .map_err(|_| AppError::Bind(config.bind.clone()))?,
    };
    if config.users.is_empty() {
        tracing::warn!("no users configured, login is disabled");
    }

    run_server(bind, config).await
}

/// Initialize tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "telemetry_web=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> Result<WebConfig, AppError> {
    let path = cli.config.clone().or_else(WebConfig::default_path);
    let mut config = match &path {
        Some(path) => match WebConfig::load(path)? {
            Some(config) => {
                tracing::info!(path = %path.display(), "loaded config");
                config
            }
            None if cli.config.is_some() => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                WebConfig::default()
            }
            None => WebConfig::default(),
        },
        None => WebConfig::default(),
    };

    if let (Some(name), Some(password)) = (&cli.user, &cli.password) {
        config.users.push(UserConfig {
            name: name.clone(),
            password: password.clone(),
        });
    }
    Ok(config)
}

async fn run_server(bind: SocketAddr, config: WebConfig) -> Result<(), AppError> {
    tracing::info!("telemetry-web starting");

    let collaborators = Collaborators::from_config(&config);
    let housekeeping = Arc::new(Housekeeping::new(
        collaborators.metrics.clone(),
        collaborators.events.clone(),
    ));
    let server = Arc::new(WebServer::new(config, collaborators));
    let shutdown = ShutdownCoordinator::new();
    let cancel = CancellationToken::new();

    let tasks = [
        housekeeping.spawn(cancel.clone()),
        server.spawn_update_ticker(cancel.clone()),
        server.spawn_event_listener(cancel.clone()),
        server.spawn_config_listener(cancel.clone()),
    ];

    let app = api::router(api::AppState {
        server: server.clone(),
        shutdown: shutdown.clone(),
    });
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C");

    // WebSocket drivers send their close frames before the listener stops.
    shutdown.shutdown();
    if tokio::time::timeout(Duration::from_secs(2), shutdown.wait_for_all_closed())
        .await
        .is_err()
    {
        tracing::warn!(
            active = shutdown.active_connections(),
            "connections still open at shutdown"
        );
    }
    let _ = server_shutdown_tx.send(());
    http_handle.await??;

    cancel.cancel();
    for task in tasks {
        task.await?;
    }

    tracing::info!(clients = server.client_count(), "telemetry-web exiting");
    Ok(())
}
