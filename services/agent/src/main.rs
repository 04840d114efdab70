//! Fleet Node Agent
//!
//! Keeps the control channel to the orchestration server open and serves its
//! requests until Ctrl-C or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_agent::handlers::register_builtin;
use fleet_agent::host::{CapabilityProvider, HostCapabilities};
use fleet_agent::{
    CommandBus, Config, ConnectionManager, GrpcTransport, QueryBus, Registrar, ShutdownSignal,
    StreamSupervisor, SupervisorSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first so its log level can seed the filter
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        agent_id = %config.agent_id,
        server_url = %config.server_url,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        metrics_secs = config.metrics_interval.as_secs(),
        "Starting fleet agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut shutdown = ShutdownSignal::new(shutdown_rx);

    let capabilities: Arc<dyn CapabilityProvider> = Arc::new(HostCapabilities::new());
    let commands = Arc::new(CommandBus::new());
    let queries = Arc::new(QueryBus::new());
    register_builtin(&commands, &queries, config.agent_id.clone(), Arc::clone(&capabilities))
        .context("failed to register built-in handlers")?;

    let transport = Arc::new(GrpcTransport::new(&config));
    let connection = Arc::new(ConnectionManager::new(transport, config.backoff));
    let registrar = Arc::new(Registrar::new(
        connection,
        config.agent_id.clone(),
        capabilities,
        config.backoff,
    ));

    // Registration failures other than shutdown end the process here
    let registered = tokio::select! {
        result = registrar.register(&mut shutdown) => result,
        _ = wait_for_signal() => {
            let _ = shutdown_tx.send(true);
            return Ok(());
        }
    };
    match registered {
        Ok(()) => {}
        Err(e) if e.is_shutdown() => return Ok(()),
        Err(e) => {
            error!(error = %e, reason = e.reason_code(), "Registration failed");
            return Err(e.into());
        }
    }

    let supervisor = StreamSupervisor::new(
        Arc::clone(&registrar),
        Arc::clone(&commands),
        Arc::clone(&queries),
        SupervisorSettings::from(&config),
    );
    let mut supervisor_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { supervisor.run(shutdown).await }
    });

    let exit = tokio::select! {
        _ = wait_for_signal() => {
            info!("Received shutdown signal");
            None
        }
        result = &mut supervisor_handle => Some(result),
    };

    // Signal shutdown to everything still waiting
    let _ = shutdown_tx.send(true);
    commands.shutdown();
    queries.shutdown();

    info!(grace_secs = config.shutdown_grace.as_secs(), "Waiting for in-flight requests...");
    let drained = tokio::time::timeout(config.shutdown_grace, async {
        commands.wait_for_completion().await;
        queries.wait_for_completion().await;
    })
    .await;
    if drained.is_err() {
        warn!(
            commands = commands.in_flight(),
            queries = queries.in_flight(),
            "Shutdown grace period elapsed with requests still running"
        );
    }

    let result = match exit {
        Some(result) => result,
        None => match tokio::time::timeout(config.shutdown_grace, supervisor_handle).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Stream supervisor did not stop in time");
                Ok(Ok(()))
            }
        },
    };

    match result {
        Ok(Ok(())) => {
            info!("Fleet agent shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, reason = e.reason_code(), "Stream supervisor failed");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Stream supervisor task panicked");
            Err(e.into())
        }
    }
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
