//! NetGuard Server
//!
//! Central ingestion, anomaly scoring and alerting for NetGuard agents.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        NETGUARD SERVER                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌────────────────────┐  │
//! │  │  Agent      │   │  Pipeline   │   │  Alert Engine      │  │
//! │  │  Listener   │──▶│  decode /   │──▶│  history / bus /   │  │
//! │  │  (AES-GCM)  │   │  analyze    │   │  email / slack     │  │
//! │  └─────────────┘   └─────────────┘   └────────────────────┘  │
//! │                                                              │
//! │  HTTP (Axum): /metrics  /health  /api/v1/agents  /alerts     │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netguard_server::app::{self, Services};
use netguard_server::config::Config;
use netguard_server::crypto;
use netguard_server::session::AgentServer;

#[derive(Parser)]
#[command(name = "netguard-server")]
#[command(about = "NetGuard telemetry ingestion and alerting server", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent listener and HTTP surface (default)
    Serve {
        /// Agent listener host
        #[arg(long)]
        host: Option<String>,

        /// Agent listener port
        #[arg(long)]
        port: Option<u16>,

        /// Metrics / API port
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Print a fresh frame encryption key (64 hex chars)
    Keygen,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Keygen) = cli.command {
        println!("{}", crypto::generate_key());
        return Ok(());
    }

    dotenvy::dotenv().ok();
    init_logging(cli.log_json);

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(Commands::Serve { host, port, metrics_port }) = cli.command {
        if let Some(host) = host {
            config.server.host = host;
        }
        if let Some(port) = port {
            config.server.port = port;
        }
        if let Some(port) = metrics_port {
            config.server.metrics_port = port;
        }
    }

    serve(config).await
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "netguard_server=info,tower_http=info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!("NetGuard Server starting...");

    let metrics_addr = config.server.metrics_addr()?;
    let agent_addr = config.server.agent_addr();
    let grace = config.server.shutdown_grace();

    let services = Services::build(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // HTTP surface
    let http_listener = tokio::net::TcpListener::bind(metrics_addr).await
        .with_context(|| format!("Failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("📈 Metrics and API on http://{}", metrics_addr);
    let router = netguard_server::create_router(services.app_state());
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // Agent listener
    let agents = AgentServer::bind(&agent_addr, services.session_context()).await
        .with_context(|| format!("Failed to bind agent listener on {}", agent_addr))?;
    tracing::info!("🚀 Agent listener on {}", agent_addr);
    let listener = tokio::spawn(agents.run(shutdown_rx.clone(), grace));

    let sweeper = app::spawn_sweeper(services.analyzer.clone(), app::SWEEP_INTERVAL, shutdown_rx.clone());
    let alert_log = app::spawn_alert_log(&services.bus, shutdown_rx);

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    shutdown_tx.send_replace(true);

    if let Err(e) = listener.await {
        tracing::error!("Agent listener task failed: {}", e);
    }
    let abandoned = services.pipeline
        .drain_notifications(services.config.notifications.timeout())
        .await;
    if abandoned > 0 {
        tracing::warn!(abandoned, "Shut down with undelivered notifications");
    }
    match http.await {
        Ok(Err(e)) => tracing::error!("HTTP server error: {}", e),
        Err(e) => tracing::error!("HTTP task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = sweeper.await;
    let _ = alert_log.await;

    tracing::info!(
        alerts = services.metrics.alerts_generated.get(),
        packets = services.metrics.packets_processed.get(),
        "NetGuard Server stopped"
    );
    Ok(())
}
