use std::time::Duration;
use thiserror::Error;

/// Reasons a descriptor is refused by [`crate::Supervisor::register`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("service name must not be empty")]
    EmptyName,

    #[error("service '{0}' is already registered")]
    Duplicate(String),

    #[error("service '{service}' lists an empty dependency name")]
    EmptyDependency { service: String },
}

/// Whole-graph failures of dependency resolution. Any of these aborts startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("circular dependency detected at service '{service}'")]
    Cycle { service: String },

    #[error("service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },
}

/// Failure of a single service start.
#[derive(Error, Debug)]
pub enum StartError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("start did not complete within {0:?}")]
    Timeout(Duration),

    #[error("start task panicked")]
    Panicked,

    #[error("supervisor stopped before the start completed")]
    Stopped,

    #[error("{0}")]
    Other(String),
}

/// Requests the gateway refuses before choosing an upstream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("path is outside subfolder '{0}'")]
    OutsideSubfolder(String),

    #[error("path contains a parent directory segment")]
    Traversal,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
