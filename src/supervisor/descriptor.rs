use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::environment::Environment;
use crate::error::StartError;

/// Service category. Only `Critical` changes supervisor behaviour: a failed
/// critical start is retried during startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Install,
    #[default]
    Web,
    System,
    Critical,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Install => "install",
            ServiceKind::Web => "web",
            ServiceKind::System => "system",
            ServiceKind::Critical => "critical",
        }
    }
}

/// Start and health operations of a managed unit of work.
///
/// `start` should resolve once the unit is launched, not once it is ready;
/// readiness is what `health` reports. `health` must not touch supervisor
/// state. Both run in their own tasks, so a panic is contained.
#[async_trait]
pub trait Service: Send + Sync {
    async fn start(&self, env: &Environment) -> Result<ProcessHandle, StartError>;

    async fn health(&self) -> bool;
}

/// Immutable description of one supervised service.
#[derive(Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub dependencies: Vec<String>,
    pub kind: ServiceKind,
    service: Arc<dyn Service>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, kind: ServiceKind, service: impl Service + 'static) -> Self {
        Self::from_arc(name, kind, Arc::new(service))
    }

    pub fn from_arc(name: impl Into<String>, kind: ServiceKind, service: Arc<dyn Service>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            kind,
            service,
        }
    }

    /// Set dependencies, dropping repeated names while keeping first-seen order.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut deps: Vec<String> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        self.dependencies = deps;
        self
    }

    pub fn service(&self) -> Arc<dyn Service> {
        Arc::clone(&self.service)
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send + Sync>;

/// Grace period between SIGTERM and SIGKILL when cleaning up a child.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Handle to a launched service.
///
/// Cleanup runs at most once; later calls are no-ops. `attempts` counts
/// failed health checks since this handle was installed.
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Option<Arc<Mutex<Child>>>,
    cleanup: StdMutex<Option<CleanupFn>>,
    started_at: Instant,
    attempts: AtomicU32,
}

impl ProcessHandle {
    /// Handle for work not owned as an OS process.
    pub fn detached() -> Self {
        Self {
            pid: None,
            child: None,
            cleanup: StdMutex::new(None),
            started_at: Instant::now(),
            attempts: AtomicU32::new(0),
        }
    }

    /// Handle owning a child process. Cleanup terminates it.
    pub fn from_child(child: Child, grace: Duration) -> Self {
        let pid = child.id();
        let child = Arc::new(Mutex::new(child));
        let target = Arc::clone(&child);
        Self {
            pid,
            child: Some(child),
            cleanup: StdMutex::new(Some(Box::new(move || {
                Box::pin(terminate_child(target, grace)) as CleanupFuture
            }))),
            started_at: Instant::now(),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Replace the cleanup operation.
    pub fn with_cleanup<F, Fut>(self, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        *self.lock_cleanup() = Some(Box::new(move || Box::pin(cleanup()) as CleanupFuture));
        self
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn child(&self) -> Option<Arc<Mutex<Child>>> {
        self.child.clone()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Returns the new count.
    pub fn record_attempt(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Run the cleanup operation once.
    pub async fn cleanup(&self) {
        let cleanup = self.lock_cleanup().take();
        if let Some(cleanup) = cleanup {
            cleanup().await;
        }
    }

    fn lock_cleanup(&self) -> std::sync::MutexGuard<'_, Option<CleanupFn>> {
        self.cleanup.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("attempts", &self.attempts())
            .finish_non_exhaustive()
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Tolerates an exited child.
async fn terminate_child(child: Arc<Mutex<Child>>, grace: Duration) {
    let mut child = child.lock().await;

    match child.try_wait() {
        Ok(Some(status)) => {
            debug!("Process already exited ({})", status);
            return;
        }
        Ok(None) => {}
        Err(e) => debug!("Failed to poll process: {}", e),
    }

    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: signalling a pid we spawned and have not yet reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!("Process stopped ({})", status),
        Ok(Err(e)) => debug!("Failed to wait for process: {}", e),
        Err(_) => {
            warn!(
                "Process {:?} did not stop within {:?}, force killing",
                child.id(),
                grace
            );
            if let Err(e) = child.kill().await {
                debug!("Force kill failed: {}", e);
            }
        }
    }
}
