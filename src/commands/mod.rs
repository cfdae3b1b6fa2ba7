pub(crate) mod plan;
pub(crate) mod proxy;
pub(crate) mod run;

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use supervisor::supervisor::CommandService;
use supervisor::{ProcessEnvironment, Supervisor, SupervisorConfig};

/// Load the config from `path`, or from the default location.
pub(crate) fn load_config(path: Option<PathBuf>) -> anyhow::Result<SupervisorConfig> {
    let path = path.unwrap_or_else(supervisor::clienv::config_path);
    SupervisorConfig::load(&path).with_context(|| format!("Failed to load {}", path.display()))
}

/// Supervisor with every configured command service registered.
pub(crate) async fn build_supervisor(config: &SupervisorConfig) -> Arc<Supervisor> {
    let environment = Arc::new(ProcessEnvironment::new(config.environment.clone()));
    let supervisor = Arc::new(Supervisor::new(config.clone(), environment));

    for service in &config.services {
        let descriptor = CommandService::new(
            service.clone(),
            supervisor.log_buffer(),
            config.health_timeout(),
        )
        .into_descriptor();
        // Rejections are logged by the supervisor.
        let _ = supervisor.register(descriptor).await;
    }
    supervisor
}

/// Resolves on SIGINT or SIGTERM (Ctrl+C elsewhere).
pub(crate) async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Failed to install signal handlers: {}", e);
            }
        }
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Received Ctrl+C");
}
