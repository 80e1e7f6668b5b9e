mod agent;
mod callbacks;
mod config;
mod core;
mod error;
mod events;
mod features;
mod orchestrator;
mod providers;
mod reconciler;
mod registration;
mod vendor;

use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::registration::RegistrationState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper_util=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = AgentConfig::from_env()?;
    let bind = config.bind_addr.clone();
    let agent = Agent::bootstrap(config).await?;

    // A prior instance of this agent may have crashed mid-deploy holding
    // Redis locks for labs it no longer knows about; drop them before
    // accepting new work so a stuck lock doesn't block every future deploy
    // for that lab.
    match agent.workspace.known_labs().await {
        Ok(labs) => {
            if let Err(e) = agent.locks.clear_agent_locks(&labs).await {
                warn!(error = %e, "startup lock recovery failed");
            }
        }
        Err(e) => warn!(error = %e, "failed to list known labs during startup recovery"),
    }

    let cancel = CancellationToken::new();
    let registration_state = Arc::new(RegistrationState::new(&agent.config.agent_id));

    let registration_handle = registration::spawn(agent.clone(), registration_state, cancel.clone());
    let events_handle = events::spawn(agent.clone(), cancel.clone());
    let reconciler_handle = reconciler::spawn(agent.clone(), cancel.clone());

    let app = features::router().layer(axum::Extension(agent.clone()));
    info!(%bind, agent_id = %agent.config.agent_id, "agent listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    for handle in [registration_handle, events_handle, reconciler_handle] {
        let _ = handle.await;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
