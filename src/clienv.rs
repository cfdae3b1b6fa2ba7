use std::path::PathBuf;

/// Environment variables read by the supervisor and the gateway.
#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    SupervisorConfig,
    Subfolder,
    Password,
    CustomUser,
    CustomPort,
    DisabledServices,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::SupervisorConfig => "SUPERVISOR_CONFIG",
            EnvVar::Subfolder => "SUBFOLDER",
            EnvVar::Password => "PASSWORD",
            EnvVar::CustomUser => "CUSTOM_USER",
            EnvVar::CustomPort => "CUSTOM_PORT",
            EnvVar::DisabledServices => "DISABLED_SERVICES",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "/etc";
const SUPERVISOR_SUBDIR: &str = "supervisor";
const CONFIG_FILE: &str = "config.toml";

/// Non-empty value of an environment variable.
fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Config file path ($SUPERVISOR_CONFIG or ~/.config/supervisor/config.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::SupervisorConfig.as_str())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(SUPERVISOR_SUBDIR)
                .join(CONFIG_FILE)
        });
    tracing::trace!(path = %path.display(), "Resolved config path");
    path
}

/// Subfolder the proxied application is exposed under ($SUBFOLDER)
pub fn subfolder() -> Option<String> {
    let val = env_opt(EnvVar::Subfolder.as_str());
    tracing::trace!(value = ?val, "SUBFOLDER env var");
    val
}

/// Basic auth password ($PASSWORD). Set but empty disables auth.
pub fn password() -> Option<String> {
    let val = std::env::var(EnvVar::Password.as_str()).ok();
    tracing::trace!(set = val.is_some(), "PASSWORD env var");
    val
}

/// Basic auth username ($CUSTOM_USER)
pub fn username() -> Option<String> {
    let val = env_opt(EnvVar::CustomUser.as_str());
    tracing::trace!(value = ?val, "CUSTOM_USER env var");
    val
}

/// Public gateway port ($CUSTOM_PORT)
pub fn listen_port() -> Option<u16> {
    let val = env_opt(EnvVar::CustomPort.as_str()).and_then(|s| s.trim().parse().ok());
    tracing::trace!(value = ?val, "CUSTOM_PORT env var");
    val
}

/// Services disabled by the operator ($DISABLED_SERVICES, comma separated)
pub fn disabled_services() -> Vec<String> {
    let list = env_opt(EnvVar::DisabledServices.as_str())
        .map(|s| parse_list(&s))
        .unwrap_or_default();
    tracing::trace!(value = ?list, "DISABLED_SERVICES env var");
    list
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_list_skips_blanks() {
        assert_eq!(parse_list(" vnc, ,audio,"), vec!["vnc", "audio"]);
        assert!(parse_list("").is_empty());
    }
}
