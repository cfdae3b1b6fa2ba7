//! Path scoping and upstream selection for the gateway.

use crate::config::ProxyConfig;
use crate::error::RouteError;

/// Where a single inbound request goes. Computed per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Request path with the subfolder removed; always starts with `/`.
    pub path: String,
    pub port: u16,
    pub bypass_auth: bool,
}

/// The gateway's complete routing policy.
#[derive(Debug, Clone)]
pub struct RouteTable {
    subfolder: Option<String>,
    data_prefix: String,
    websocket_prefix: String,
    web_port: u16,
    stream_port: u16,
}

impl RouteTable {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            subfolder: normalize_subfolder(&config.subfolder),
            data_prefix: normalize_prefix(&config.data_prefix),
            websocket_prefix: normalize_prefix(&config.websocket_prefix),
            web_port: config.web_port,
            stream_port: config.stream_port,
        }
    }

    pub fn subfolder(&self) -> Option<&str> {
        self.subfolder.as_deref()
    }

    /// Strip the subfolder, reject traversal, then pick upstream and auth mode.
    pub fn decide(&self, path: &str) -> Result<RouteDecision, RouteError> {
        let path = strip_prefix(path, self.subfolder())
            .ok_or_else(|| RouteError::OutsideSubfolder(self.subfolder().unwrap_or("/").to_string()))?;

        if has_parent_segment(&path) {
            return Err(RouteError::Traversal);
        }

        Ok(RouteDecision {
            port: self.select_upstream(&path),
            bypass_auth: self.should_bypass_auth(&path),
            path,
        })
    }

    /// First matching rule wins; the web UI is the fallback.
    pub fn select_upstream(&self, path: &str) -> u16 {
        let rules = [(self.data_prefix.as_str(), self.stream_port)];
        rules
            .iter()
            .find(|(prefix, _)| matches_prefix(path, prefix))
            .map_or(self.web_port, |(_, port)| *port)
    }

    /// Only the data and WebSocket routes skip Basic auth; their backends
    /// authenticate on their own.
    pub fn should_bypass_auth(&self, path: &str) -> bool {
        matches_prefix(path, &self.data_prefix) || matches_prefix(path, &self.websocket_prefix)
    }
}

/// `"desk"`, `"/desk"` and `"/desk/"` all become `"/desk/"`. Root means none.
pub fn normalize_subfolder(subfolder: &str) -> Option<String> {
    let trimmed = subfolder.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{trimmed}/"))
    }
}

fn normalize_prefix(prefix: &str) -> String {
    format!("/{}", prefix.trim().trim_matches('/'))
}

/// Remove `subfolder` (normalized, with trailing slash) from `path`.
///
/// Returns `None` when a subfolder is set and `path` lies outside it. Without
/// a subfolder the path passes through unchanged.
pub fn strip_prefix(path: &str, subfolder: Option<&str>) -> Option<String> {
    let Some(subfolder) = subfolder else {
        return Some(path.to_string());
    };

    let root = subfolder.trim_end_matches('/');
    if path == root || path == subfolder {
        return Some("/".to_string());
    }
    path.strip_prefix(subfolder).map(|rest| format!("/{rest}"))
}

/// Exact match, or `prefix` followed by `/` or `?`.
pub fn matches_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
        None => false,
    }
}

/// A segment that reads `..` once `%2e` escapes are decoded, in any mix.
fn has_parent_segment(path: &str) -> bool {
    path.split('/')
        .any(|segment| segment.to_ascii_lowercase().replace("%2e", ".") == "..")
}
