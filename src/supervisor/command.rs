use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::info;

use super::descriptor::{ProcessHandle, Service, ServiceDescriptor, DEFAULT_STOP_GRACE};
use super::health::{child_alive, probe_http, probe_tcp, HealthCheck};
use super::log_buffer::LogBuffer;
use crate::config::ServiceConfig;
use crate::environment::Environment;
use crate::error::StartError;

/// A service backed by an external command, spawned as a child process.
pub struct CommandService {
    config: ServiceConfig,
    log_buffer: Arc<LogBuffer>,
    http: reqwest::Client,
    probe_timeout: Duration,
    current: StdMutex<Option<Arc<Mutex<Child>>>>,
}

impl CommandService {
    pub fn new(config: ServiceConfig, log_buffer: Arc<LogBuffer>, probe_timeout: Duration) -> Self {
        Self {
            config,
            log_buffer,
            http: reqwest::Client::new(),
            probe_timeout,
            current: StdMutex::new(None),
        }
    }

    /// Wrap in a descriptor carrying the configured name, kind and dependencies.
    pub fn into_descriptor(self) -> ServiceDescriptor {
        let name = self.config.name.clone();
        let kind = self.config.kind;
        let dependencies = self.config.dependencies.clone();
        ServiceDescriptor::new(name, kind, self).with_dependencies(dependencies)
    }

    fn build_command(&self, env: &Environment) -> Command {
        let mut env = env.clone();
        for (key, value) in &self.config.env {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn current_child(&self) -> Option<Arc<Mutex<Child>>> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Service for CommandService {
    async fn start(&self, env: &Environment) -> Result<ProcessHandle, StartError> {
        let name = &self.config.name;
        self.log_buffer.clear(name);

        let mut child = self
            .build_command(env)
            .spawn()
            .map_err(|source| StartError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        info!("Spawned '{}' with PID {:?}", name, child.id());
        spawn_log_readers(name, &mut child, &self.log_buffer);

        let handle = ProcessHandle::from_child(child, DEFAULT_STOP_GRACE);
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = handle.child();
        Ok(handle)
    }

    async fn health(&self) -> bool {
        match &self.config.health {
            HealthCheck::Process => match self.current_child() {
                Some(child) => child_alive(&mut *child.lock().await, self.config.oneshot),
                None => false,
            },
            HealthCheck::Tcp { port, host } => probe_tcp(host, *port, self.probe_timeout).await,
            HealthCheck::Http { url } => probe_http(&self.http, url, self.probe_timeout).await,
            HealthCheck::None => true,
        }
    }
}

/// Forward child stdout/stderr into tracing and the log buffer.
fn spawn_log_readers(service_name: &str, child: &mut Child, log_buffer: &Arc<LogBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        forward_lines(service_name, stdout, log_buffer);
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(service_name, stderr, log_buffer);
    }
}

fn forward_lines<R>(service_name: &str, stream: R, log_buffer: &Arc<LogBuffer>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buf = Arc::clone(log_buffer);
    let name = service_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "service", service = %name, "{}", line);
            buf.push(&name, line);
        }
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::ServiceKind;
    use std::collections::BTreeMap;

    fn config(command: &str, args: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: "probe".into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            working_dir: None,
            dependencies: vec!["xvfb".into()],
            kind: ServiceKind::System,
            health: HealthCheck::Process,
            oneshot: false,
        }
    }

    #[tokio::test]
    async fn captures_output_and_reports_exit() {
        let buffer = Arc::new(LogBuffer::default());
        let service = CommandService::new(
            config("sh", &["-c", "echo \"display=$DISPLAY\""]),
            Arc::clone(&buffer),
            Duration::from_secs(1),
        );
        let env: Environment = [("DISPLAY".to_string(), ":3".to_string())]
            .into_iter()
            .collect();

        let handle = service.start(&env).await.unwrap();
        assert!(handle.pid().is_some());

        let child = handle.child().unwrap();
        child.lock().await.wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(buffer.tail("probe", 10), vec!["display=:3"]);
        assert!(!service.health().await);
        handle.cleanup().await;
    }

    #[tokio::test]
    async fn healthy_while_running_and_cleanup_stops_it() {
        let service = CommandService::new(
            config("sleep", &["30"]),
            Arc::new(LogBuffer::default()),
            Duration::from_secs(1),
        );
        let handle = service.start(&Environment::new()).await.unwrap();
        assert!(service.health().await);

        handle.cleanup().await;
        assert!(!service.health().await);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let service = CommandService::new(
            config("/nonexistent/binary", &[]),
            Arc::new(LogBuffer::default()),
            Duration::from_secs(1),
        );
        let err = service.start(&Environment::new()).await.unwrap_err();
        assert!(matches!(err, StartError::Spawn { .. }));
        assert!(!service.health().await);
    }

    #[test]
    fn descriptor_carries_config() {
        let desc = CommandService::new(
            config("true", &[]),
            Arc::new(LogBuffer::default()),
            Duration::from_secs(1),
        )
        .into_descriptor();
        assert_eq!(desc.name, "probe");
        assert_eq!(desc.kind, ServiceKind::System);
        assert_eq!(desc.dependencies, vec!["xvfb"]);
    }
}
