//! Exchange client - keeps a wallet in sync with a token exchange
//!
//! Connects to a node, binds the configured token and exchange contracts,
//! logs every state event, and reads transfer commands from stdin.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use exchange_client::agent::{ChainAgent, RpcAgent};
use exchange_client::config::Settings;
use exchange_client::events::TracingSink;
use exchange_client::metrics::MetricsServer;
use exchange_client::{Session, SessionCommand};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(settings.logging.json);

    info!("Starting exchange client v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Loaded configuration for networks {:?}",
        settings.supported_networks()
    );

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let agent: Arc<dyn ChainAgent> = Arc::new(
        RpcAgent::connect(&settings.agent)
            .await
            .context("Failed to connect chain-access agent")?,
    );

    let directory = Arc::new(settings.clone());
    let mut session = Session::new(Some(agent), directory, Arc::new(TracingSink));

    if let Err(e) = session.start().await {
        if e.is_fatal() {
            error!("Setup failed: {}", e);
            return Err(e).context("Pipeline could not start");
        }
        warn!("{} - type `account` to retry", e);
    }

    // Commands from stdin
    let (command_tx, command_rx) = mpsc::channel(16);
    let input_handle = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<SessionCommand>() {
                    Ok(command) => {
                        if command_tx.send(command).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    info!("Exchange client is running");
    info!("Commands: deposit <1|2> <amount>, withdraw <1|2> <amount>, account, refresh");

    session.run(command_rx, shutdown_signal()).await?;

    input_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Exchange client stopped");
    Ok(())
}

fn init_logging(json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,exchange_client=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
