//! Built-in health probes for command-backed services.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Child;
use tracing::{debug, trace};

/// How a command-backed service proves it is alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthCheck {
    /// The spawned process has not exited
    #[default]
    Process,
    /// A TCP connect to the port succeeds
    Tcp {
        port: u16,
        #[serde(default = "default_probe_host")]
        host: String,
    },
    /// A GET returns a success or redirect status
    Http { url: String },
    /// Always healthy
    None,
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

/// Connect to `host:port` within `timeout`.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("TCP probe {}:{} failed: {}", host, port, e);
            false
        }
        Err(_) => {
            debug!("TCP probe {}:{} timed out after {:?}", host, port, timeout);
            false
        }
    }
}

/// GET `url` within `timeout`; 2xx and 3xx count as healthy.
pub async fn probe_http(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) => {
            let status = resp.status();
            trace!("HTTP probe {} -> {}", url, status);
            status.is_success() || status.is_redirection()
        }
        Err(e) => {
            debug!("HTTP probe {} failed: {}", url, e);
            false
        }
    }
}

/// Liveness of a child. One-shot children also pass once they exit cleanly.
pub fn child_alive(child: &mut Child, oneshot: bool) -> bool {
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            debug!("Process exited ({})", status);
            oneshot && status.success()
        }
        Err(e) => {
            debug!("Failed to poll process: {}", e);
            false
        }
    }
}
