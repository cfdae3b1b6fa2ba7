use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::clienv;
use crate::error::{ConfigError, Result};
use crate::supervisor::{HealthCheck, ServiceKind};

/// Top-level supervisor configuration, loaded from TOML.
///
/// Every field has a default so an empty (or missing) file yields a working
/// supervisor with no command services and the gateway on its default ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub health_check_interval_ms: u64,
    /// Upper bound on a single health probe.
    pub health_timeout_ms: u64,
    /// Upper bound on a single service start.
    pub start_timeout_ms: u64,
    pub max_restart_attempts: u32,
    pub base_backoff_delay_ms: u64,
    pub max_backoff_delay_ms: u64,
    /// Pause before a failed critical service is started again.
    pub critical_retry_delay_ms: u64,
    /// How many extra start attempts a critical service gets during startup.
    pub critical_start_retries: u32,
    /// Pause before the whole startup sequence is retried after a fatal error.
    pub startup_retry_delay_ms: u64,
    /// Services skipped at startup and ignored by the health loop.
    pub disabled: Vec<String>,
    pub environment: EnvironmentConfig,
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfig>,
    pub proxy: ProxyConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5_000,
            health_timeout_ms: 5_000,
            start_timeout_ms: 120_000,
            max_restart_attempts: 5,
            base_backoff_delay_ms: 5_000,
            max_backoff_delay_ms: 60_000,
            critical_retry_delay_ms: 5_000,
            critical_start_retries: 1,
            startup_retry_delay_ms: 10_000,
            disabled: Vec::new(),
            environment: EnvironmentConfig::default(),
            services: Vec::new(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    /// Environment overrides are applied on top.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading supervisor config");

        let mut config = if path.exists() {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
            toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            tracing::debug!(path = %path.display(), "Config file does not exist, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(subfolder) = clienv::subfolder() {
            self.proxy.subfolder = subfolder;
        }
        if let Some(password) = clienv::password() {
            self.proxy.password = password;
        }
        if let Some(username) = clienv::username() {
            self.proxy.username = username;
        }
        if let Some(port) = clienv::listen_port() {
            self.proxy.listen_port = port;
        }
        for name in clienv::disabled_services() {
            if !self.disabled.contains(&name) {
                self.disabled.push(name);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "health_check_interval_ms must be greater than zero".into(),
            ));
        }
        if self.base_backoff_delay_ms > self.max_backoff_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "base_backoff_delay_ms ({}) exceeds max_backoff_delay_ms ({})",
                self.base_backoff_delay_ms, self.max_backoff_delay_ms
            )));
        }
        let ports = [
            self.proxy.listen_port,
            self.proxy.web_port,
            self.proxy.stream_port,
        ];
        if ports[0] == ports[1] || ports[0] == ports[2] {
            return Err(ConfigError::Invalid(format!(
                "proxy listen_port {} collides with an upstream port",
                self.proxy.listen_port
            )));
        }
        Ok(())
    }

    pub fn is_disabled(&self, name: &str) -> bool {
        self.disabled.iter().any(|d| d == name)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn critical_retry_delay(&self) -> Duration {
        Duration::from_millis(self.critical_retry_delay_ms)
    }

    pub fn startup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.startup_retry_delay_ms)
    }
}

/// Variables the supervisor injects into every service environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Applied only where the process environment has no value.
    pub defaults: BTreeMap<String, String>,
    /// Appended to `PATH` when missing from it.
    pub extra_paths: Vec<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        let defaults = [
            ("DISPLAY", ":1"),
            ("HOME", "/config"),
            ("TMPDIR", "/tmp"),
            ("XDG_RUNTIME_DIR", "/tmp/runtime-root"),
            ("XDG_SESSION_TYPE", "x11"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            defaults,
            extra_paths: vec!["/usr/local/bin".into(), "/config/.local/bin".into()],
        }
    }
}

/// A service backed by an external command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub kind: ServiceKind,
    #[serde(default)]
    pub health: HealthCheck,
    /// The process is expected to exit once its work is done.
    #[serde(default)]
    pub oneshot: bool,
}

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: u16,
    /// Primary web UI upstream.
    pub web_port: u16,
    /// Desktop streaming upstream.
    pub stream_port: u16,
    pub upstream_host: String,
    pub username: String,
    /// Empty disables authentication entirely.
    pub password: String,
    pub subfolder: String,
    pub data_prefix: String,
    pub websocket_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            web_port: 3001,
            stream_port: 6901,
            upstream_host: "127.0.0.1".to_string(),
            username: "kasm_user".to_string(),
            password: String::new(),
            subfolder: "/".to_string(),
            data_prefix: "/data".to_string(),
            websocket_prefix: "/websockify".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_restart_attempts, 5);
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert!(config.services.is_empty());
    }

    #[test]
    fn parses_services_and_proxy() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
max_restart_attempts = 3
disabled = ["audio"]

[proxy]
web_port = 8080
subfolder = "/desk/"

[[service]]
name = "xvfb"
command = "Xvfb"
args = [":1"]
kind = "critical"
health = {{ type = "process" }}

[[service]]
name = "web"
command = "node"
args = ["server.js"]
dependencies = ["xvfb"]
kind = "web"
health = {{ type = "tcp", port = 8080 }}
"#
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.max_restart_attempts, 3);
        assert!(config.is_disabled("audio"));
        assert_eq!(config.proxy.web_port, 8080);
        assert_eq!(config.proxy.subfolder, "/desk/");
        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].kind, ServiceKind::Critical);
        assert_eq!(config.services[1].dependencies, vec!["xvfb"]);
        assert!(matches!(
            config.services[1].health,
            HealthCheck::Tcp { port: 8080, .. }
        ));
    }

    #[test]
    fn rejects_inverted_backoff() {
        let config = SupervisorConfig {
            base_backoff_delay_ms: 10_000,
            max_backoff_delay_ms: 1_000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_listen_port_collision() {
        let mut config = SupervisorConfig::default();
        config.proxy.listen_port = config.proxy.web_port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "max_restart_attempts = \"many\"").unwrap();
        let err = SupervisorConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
