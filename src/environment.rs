//! Environment handed to every service `start` call.

use std::collections::HashMap;

use crate::config::EnvironmentConfig;

/// Flattened key/value map passed to service starts.
pub type Environment = HashMap<String, String>;

/// Source of the environment given to services.
pub trait EnvironmentProvider: Send + Sync {
    fn environment(&self) -> Environment;
}

/// Process environment merged with supervisor defaults.
///
/// Values already present in the process environment always win; defaults
/// only fill gaps, and extra search paths are appended to `PATH` when absent.
pub struct ProcessEnvironment {
    config: EnvironmentConfig,
}

impl ProcessEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self { config }
    }

    fn merge(&self, mut env: Environment) -> Environment {
        for (key, value) in &self.config.defaults {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        if !self.config.extra_paths.is_empty() {
            let path = env.entry("PATH".to_string()).or_default();
            let mut entries: Vec<String> = path
                .split(':')
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
            for extra in &self.config.extra_paths {
                if !entries.iter().any(|p| p == extra) {
                    entries.push(extra.clone());
                }
            }
            *path = entries.join(":");
        }

        env
    }
}

impl EnvironmentProvider for ProcessEnvironment {
    fn environment(&self) -> Environment {
        self.merge(std::env::vars().collect())
    }
}

/// Fixed environment, mostly useful in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment(pub Environment);

impl EnvironmentProvider for StaticEnvironment {
    fn environment(&self) -> Environment {
        self.0.clone()
    }
}
