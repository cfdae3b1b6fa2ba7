use std::path::PathBuf;

use supervisor::GatewayServer;

pub(crate) async fn cmd_proxy(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = super::load_config(config)?;
    GatewayServer::new(&config.proxy)?
        .run(super::shutdown_signal())
        .await
}
