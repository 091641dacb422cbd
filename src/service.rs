use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ghost_forwarder::authorization::GraphqlAuthorizer;
use ghost_forwarder::config::{Cli, EnvSettingsSource};
use ghost_forwarder::core::error::SupervisorError;
use ghost_forwarder::core::supervisor::Supervisor;
use ghost_forwarder::health;
use ghost_forwarder::lnd_adapters::LndConnector;
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("ghost-forwarder v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let authorizer = GraphqlAuthorizer::new(cli.authorizer_config())
        .context("failed to build authorization client")?;
    info!("Authorizing ghost payments against {}", authorizer.endpoint());

    let supervisor = Supervisor::new(
        Arc::new(EnvSettingsSource::from_env()),
        Arc::new(LndConnector::new()),
        Arc::new(authorizer),
    )
    .with_retry_policy(cli.retry_policy())
    .with_shutdown(shutdown.clone());

    let listener = health::bind(cli.health_addr).await?;
    let mut health_server = tokio::spawn(health::serve(
        listener,
        supervisor.connectivity(),
        shutdown.clone(),
    ));
    let supervisor_task = supervisor.spawn();

    // Losing the health endpoint ends the process.
    let health_result = tokio::select! {
        signal = wait_for_signal() => {
            signal?;
            None
        }
        result = &mut health_server => Some(result),
    };
    shutdown.cancel();

    match supervisor_task.await {
        Ok(Ok(())) => {}
        // Already logged when it happened; the health endpoint kept
        // reporting it until now.
        Ok(Err(SupervisorError::RetryExhausted { attempts })) => {
            warn!("Supervisor had given up after {} attempts", attempts)
        }
        Ok(Err(e)) => error!("Supervisor stopped with error: {}", e),
        Err(e) => error!("Supervisor task failed: {}", e),
    }
    match health_result {
        None => match health_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Health server stopped with error: {:#}", e),
            Err(e) => error!("Health server task failed: {}", e),
        },
        Some(Ok(Ok(()))) => bail!("health server stopped unexpectedly"),
        Some(Ok(Err(e))) => return Err(e.context("health server failed")),
        Some(Err(e)) => bail!("health server task failed: {}", e),
    }

    info!("Shut down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl-C), initiating shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, initiating shutdown");
    Ok(())
}
