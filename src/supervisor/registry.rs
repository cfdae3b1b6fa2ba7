use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::descriptor::ProcessHandle;

/// Lifecycle state of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Registered, never started
    Registered,
    /// `start` in flight
    Starting,
    /// Last `start` returned a handle
    Running,
    /// Last probe failed, or a restart failed
    Unhealthy,
    /// Waiting out backoff before starting again
    Restarting,
    /// Start failed or restart attempts exhausted; not probed
    Failed,
    /// Torn down by `stop()`
    Stopped,
}

impl ServiceState {
    /// Whether the health loop should probe a service in this state.
    pub fn is_probed(&self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Unhealthy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Registered => "registered",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Restarting => "restarting",
            ServiceState::Failed => "failed",
            ServiceState::Stopped => "stopped",
        }
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
    /// Restarts since the supervisor started
    pub restarts: u32,
    /// Failed health checks against the current handle
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub struct ManagedService {
    pub state: ServiceState,
    pub handle: Option<Arc<ProcessHandle>>,
    pub restarts: u32,
    pub last_error: Option<String>,
}

impl ManagedService {
    fn new() -> Self {
        Self {
            state: ServiceState::Registered,
            handle: None,
            restarts: 0,
            last_error: None,
        }
    }

    fn to_info(&self, name: &str) -> ServiceInfo {
        ServiceInfo {
            name: name.to_string(),
            state: self.state,
            pid: self.handle.as_ref().and_then(|h| h.pid()),
            uptime_secs: self
                .handle
                .as_ref()
                .filter(|_| self.state == ServiceState::Running)
                .map(|h| h.uptime().as_secs()),
            restarts: self.restarts,
            attempts: self.handle.as_ref().map_or(0, |h| h.attempts()),
            last_error: self.last_error.clone(),
        }
    }
}

/// Running service handles keyed by name. Mutated only by the supervisor.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    services: RwLock<HashMap<String, ManagedService>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, name: &str) {
        self.services
            .write()
            .await
            .insert(name.to_string(), ManagedService::new());
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    pub async fn state(&self, name: &str) -> Option<ServiceState> {
        self.services.read().await.get(name).map(|s| s.state)
    }

    /// Update state unless the service was stopped.
    pub async fn set_state(&self, name: &str, state: ServiceState) {
        if let Some(service) = live_mut(&mut *self.services.write().await, name) {
            service.state = state;
        }
    }

    /// Move to `Starting`. Refused once the service is stopped.
    pub async fn begin_start(&self, name: &str) -> bool {
        match live_mut(&mut *self.services.write().await, name) {
            Some(service) => {
                service.state = ServiceState::Starting;
                true
            }
            None => false,
        }
    }

    /// Record a successful start, returning any handle it replaces.
    ///
    /// A stopped service keeps its state and the new handle is handed back
    /// so the caller can clean it up.
    pub async fn mark_started(
        &self,
        name: &str,
        handle: ProcessHandle,
    ) -> Result<Option<Arc<ProcessHandle>>, ProcessHandle> {
        let mut services = self.services.write().await;
        let Some(service) = live_mut(&mut services, name) else {
            return Err(handle);
        };
        service.state = ServiceState::Running;
        service.last_error = None;
        Ok(service.handle.replace(Arc::new(handle)))
    }

    pub async fn mark_failed(&self, name: &str, state: ServiceState, error: &str) {
        if let Some(service) = live_mut(&mut *self.services.write().await, name) {
            service.state = state;
            service.last_error = Some(error.to_string());
        }
    }

    pub async fn record_restart(&self, name: &str) {
        if let Some(service) = live_mut(&mut *self.services.write().await, name) {
            service.state = ServiceState::Restarting;
            service.restarts += 1;
        }
    }

    /// Count a failed health check against the current handle.
    pub async fn record_failed_check(&self, name: &str) {
        if let Some(handle) = self
            .services
            .read()
            .await
            .get(name)
            .and_then(|s| s.handle.as_ref())
        {
            handle.record_attempt();
        }
    }

    pub async fn take_handle(&self, name: &str) -> Option<Arc<ProcessHandle>> {
        self.services
            .write()
            .await
            .get_mut(name)
            .and_then(|s| s.handle.take())
    }

    /// Put every service in `state` and hand back all handles.
    ///
    /// `Stopped` is terminal; `Registered` readies the services for another
    /// startup sequence.
    pub async fn drain_handles(&self, state: ServiceState) -> Vec<(String, Arc<ProcessHandle>)> {
        let mut services = self.services.write().await;
        services
            .iter_mut()
            .filter_map(|(name, service)| {
                service.state = state;
                service.handle.take().map(|handle| (name.clone(), handle))
            })
            .collect()
    }

    pub async fn info(&self, name: &str) -> Option<ServiceInfo> {
        self.services.read().await.get(name).map(|s| s.to_info(name))
    }
}

fn live_mut<'a>(
    services: &'a mut HashMap<String, ManagedService>,
    name: &str,
) -> Option<&'a mut ManagedService> {
    services
        .get_mut(name)
        .filter(|s| s.state != ServiceState::Stopped)
}
