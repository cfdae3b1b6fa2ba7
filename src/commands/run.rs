use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use supervisor::GatewayServer;

pub(crate) async fn cmd_run(config: Option<PathBuf>, no_proxy: bool) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    let supervisor = super::build_supervisor(&config).await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = if no_proxy {
        info!("Gateway disabled");
        None
    } else {
        let server = GatewayServer::new(&config.proxy)?;
        let mut shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let stopped = async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            };
            // A failed gateway does not take the services down with it.
            if let Err(e) = server.run(stopped).await {
                error!("Gateway failed: {:#}", e);
            }
        }))
    };

    let runner = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move { supervisor.run_forever().await })
    };

    super::shutdown_signal().await;

    supervisor.stop().await;
    shutdown_tx.send_replace(true);
    runner.await?;
    if let Some(gateway) = gateway {
        gateway.await?;
    }

    for service in supervisor.list().await {
        info!(
            "{}: {} (restarts: {}{})",
            service.name,
            service.state.as_str(),
            service.restarts,
            service
                .last_error
                .map(|e| format!(", last error: {e}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
