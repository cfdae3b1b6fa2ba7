use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::descriptor::{ServiceDescriptor, ServiceKind};
use super::log_buffer::LogBuffer;
use super::registry::{ProcessRegistry, ServiceInfo, ServiceState};
use super::resolver;
use super::restart::{RestartPolicy, RestartTracker};
use crate::config::SupervisorConfig;
use crate::environment::EnvironmentProvider;
use crate::error::{RegistrationError, ResolveError, StartError};

/// Lines of captured output logged when a service turns unhealthy.
const UNHEALTHY_LOG_TAIL: usize = 20;

/// Result of one probe-and-maybe-restart step for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// Probe failed; the service was started again after `delay`
    Restarted { delay: Duration },
    /// Probe failed and the restart after `delay` failed too
    RestartFailed { delay: Duration, error: String },
    /// Restart attempts are exhausted; the service is left down
    GaveUp { attempts: u32 },
    /// The supervisor was stopped mid-restart
    Stopped,
}

/// Starts services in dependency order, probes them and restarts the
/// unhealthy ones with exponential backoff.
///
/// Descriptor list, process registry and attempt counters are owned here and
/// only touched through these methods.
pub struct Supervisor {
    config: SupervisorConfig,
    policy: RestartPolicy,
    descriptors: RwLock<Vec<Arc<ServiceDescriptor>>>,
    registry: ProcessRegistry,
    attempts: RestartTracker,
    environment: Arc<dyn EnvironmentProvider>,
    log_buffer: Arc<LogBuffer>,
    running: watch::Sender<bool>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, environment: Arc<dyn EnvironmentProvider>) -> Self {
        let (running, _) = watch::channel(true);
        Self {
            policy: RestartPolicy::from_config(&config),
            config,
            descriptors: RwLock::new(Vec::new()),
            registry: ProcessRegistry::new(),
            attempts: RestartTracker::new(),
            environment,
            log_buffer: Arc::new(LogBuffer::default()),
            running,
        }
    }

    /// Buffer that command services should write captured output into.
    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        Arc::clone(&self.log_buffer)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts.get(name)
    }

    /// Add a descriptor. Invalid descriptors are logged and refused.
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<(), RegistrationError> {
        let result = self.validate(&descriptor).await;
        if let Err(ref e) = result {
            error!("Rejected service registration: {}", e);
            return result;
        }

        let name = descriptor.name.clone();
        debug!(
            "Registered service '{}' ({}, depends on {:?})",
            name,
            descriptor.kind.as_str(),
            descriptor.dependencies
        );
        self.descriptors.write().await.push(Arc::new(descriptor));
        self.registry.insert(&name).await;
        self.attempts.reset(&name);
        Ok(())
    }

    async fn validate(&self, descriptor: &ServiceDescriptor) -> Result<(), RegistrationError> {
        if descriptor.name.trim().is_empty() {
            return Err(RegistrationError::EmptyName);
        }
        if descriptor.dependencies.iter().any(|d| d.trim().is_empty()) {
            return Err(RegistrationError::EmptyDependency {
                service: descriptor.name.clone(),
            });
        }
        if self.registry.contains(&descriptor.name).await {
            return Err(RegistrationError::Duplicate(descriptor.name.clone()));
        }
        Ok(())
    }

    pub async fn descriptors(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.descriptors.read().await.clone()
    }

    /// Start groups in dependency order.
    pub async fn plan(&self) -> Result<Vec<Vec<Arc<ServiceDescriptor>>>, ResolveError> {
        resolver::resolve(&self.descriptors().await)
    }

    /// Start every enabled service, one dependency group at a time.
    ///
    /// A dependency cycle aborts before anything is started. Within a group
    /// starts run concurrently and the whole group settles before the next.
    pub async fn start(&self) -> Result<(), ResolveError> {
        let groups = match self.plan().await {
            Ok(groups) => groups,
            Err(e) => {
                error!("Dependency resolution failed, no services started: {}", e);
                return Err(e);
            }
        };

        info!("Starting {} service group(s)", groups.len());

        for (index, group) in groups.iter().enumerate() {
            if !self.is_running() {
                info!("Supervisor stopped during startup");
                break;
            }

            let members: Vec<&Arc<ServiceDescriptor>> = group
                .iter()
                .filter(|d| {
                    let disabled = self.config.is_disabled(&d.name);
                    if disabled {
                        info!("Skipping disabled service '{}'", d.name);
                    }
                    !disabled
                })
                .collect();

            info!(
                "Starting group {}: {:?}",
                index,
                members.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
            );
            join_all(members.into_iter().map(|d| self.start_with_retry(d))).await;
        }

        info!("Startup sequence complete");
        Ok(())
    }

    /// Start once; critical services get `critical_start_retries` more tries.
    async fn start_with_retry(&self, descriptor: &Arc<ServiceDescriptor>) {
        let e = match self.start_service(descriptor).await {
            Ok(()) | Err(StartError::Stopped) => return,
            Err(e) => e,
        };

        if descriptor.kind != ServiceKind::Critical {
            warn!(
                "Service '{}' failed to start and is left down: {}",
                descriptor.name, e
            );
            return;
        }

        let mut last_error = e;
        for attempt in 1..=self.config.critical_start_retries {
            warn!(
                "Critical service '{}' failed to start ({}), retrying in {:?} ({}/{})",
                descriptor.name,
                last_error,
                self.config.critical_retry_delay(),
                attempt,
                self.config.critical_start_retries
            );
            if !self.sleep_while_running(self.config.critical_retry_delay()).await {
                return;
            }
            match self.start_service(descriptor).await {
                Ok(()) | Err(StartError::Stopped) => return,
                Err(e) => last_error = e,
            }
        }
        error!(
            "Critical service '{}' is down: {}",
            descriptor.name, last_error
        );
    }

    /// Run a descriptor's `start` and record the handle.
    ///
    /// The start runs in its own task bounded by `start_timeout`; the service
    /// is only marked running once `start` has returned a handle. A handle
    /// that arrives after `stop()` is cleaned up instead of installed.
    pub async fn start_service(&self, descriptor: &Arc<ServiceDescriptor>) -> Result<(), StartError> {
        let name = descriptor.name.as_str();
        if !self.registry.begin_start(name).await {
            return Err(StartError::Stopped);
        }

        let env = self.environment.environment();
        let service = descriptor.service();
        let mut task = tokio::spawn(async move { service.start(&env).await });

        let timeout = self.config.start_timeout();
        let result = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                debug!("Start task for '{}' ended abnormally: {}", name, join_error);
                Err(StartError::Panicked)
            }
            Err(_) => {
                task.abort();
                Err(StartError::Timeout(timeout))
            }
        };

        match result {
            Ok(handle) => {
                let pid = handle.pid();
                handle.reset_attempts();
                match self.registry.mark_started(name, handle).await {
                    Ok(previous) => {
                        if let Some(previous) = previous {
                            previous.cleanup().await;
                        }
                        info!("Started service '{}' (PID {:?})", name, pid);
                        Ok(())
                    }
                    Err(late) => {
                        info!("Supervisor stopped while '{}' was starting, cleaning up", name);
                        late.cleanup().await;
                        Err(StartError::Stopped)
                    }
                }
            }
            Err(e) => {
                error!("Failed to start service '{}': {}", name, e);
                self.registry
                    .mark_failed(name, ServiceState::Failed, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    /// Probe with `health_timeout`. Timeouts and panics count as unhealthy.
    async fn probe(&self, descriptor: &Arc<ServiceDescriptor>) -> bool {
        let service = descriptor.service();
        let mut task = tokio::spawn(async move { service.health().await });

        match tokio::time::timeout(self.config.health_timeout(), &mut task).await {
            Ok(Ok(healthy)) => healthy,
            Ok(Err(join_error)) => {
                warn!("Health probe for '{}' failed: {}", descriptor.name, join_error);
                false
            }
            Err(_) => {
                task.abort();
                warn!(
                    "Health probe for '{}' timed out after {:?}",
                    descriptor.name,
                    self.config.health_timeout()
                );
                false
            }
        }
    }

    /// Probe one service and restart it if unhealthy.
    pub async fn check_service(&self, descriptor: &Arc<ServiceDescriptor>) -> HealthOutcome {
        let name = descriptor.name.as_str();

        if self.probe(descriptor).await {
            if self.attempts.get(name) > 0 {
                info!("Service '{}' is healthy again", name);
                self.attempts.reset(name);
            }
            if self.registry.state(name).await == Some(ServiceState::Unhealthy) {
                self.registry.set_state(name, ServiceState::Running).await;
            }
            return HealthOutcome::Healthy;
        }

        warn!("Service '{}' is unhealthy", name);
        for line in self.log_buffer.tail(name, UNHEALTHY_LOG_TAIL) {
            warn!(target: "service", service = %name, "{}", line);
        }
        self.registry.record_failed_check(name).await;
        self.registry.set_state(name, ServiceState::Unhealthy).await;
        self.restart_service(descriptor).await
    }

    /// Clean up the old handle, wait out the backoff and start again.
    ///
    /// A failed restart leaves the service unhealthy; the next health pass
    /// retries it, so restarts never run faster than the probe interval.
    pub async fn restart_service(&self, descriptor: &Arc<ServiceDescriptor>) -> HealthOutcome {
        let name = descriptor.name.as_str();
        let attempts = self.attempts.get(name);

        if self.policy.is_exhausted(attempts) {
            error!(
                "Service '{}' exceeded {} restart attempts, leaving it down",
                name, self.policy.max_attempts
            );
            self.registry
                .mark_failed(name, ServiceState::Failed, "restart attempts exhausted")
                .await;
            return HealthOutcome::GaveUp { attempts };
        }

        let delay = self.policy.delay(attempts);
        self.attempts.increment(name);
        self.registry.record_restart(name).await;

        if let Some(old) = self.registry.take_handle(name).await {
            old.cleanup().await;
        }

        info!(
            "Restarting service '{}' in {:?} (attempt {}/{})",
            name,
            delay,
            attempts + 1,
            self.policy.max_attempts
        );
        if !self.sleep_while_running(delay).await {
            return HealthOutcome::Stopped;
        }

        match self.start_service(descriptor).await {
            Ok(()) => HealthOutcome::Restarted { delay },
            Err(StartError::Stopped) => HealthOutcome::Stopped,
            Err(e) => {
                self.registry
                    .mark_failed(name, ServiceState::Unhealthy, &e.to_string())
                    .await;
                HealthOutcome::RestartFailed {
                    delay,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Probe every started, enabled service concurrently and wait for all.
    ///
    /// The pass returns only after every check and every restart it triggered
    /// has finished, backoff included. A service with a long backoff therefore
    /// holds back the next pass for all services, and no service ever has two
    /// checks or restarts in flight.
    pub async fn health_pass(&self) -> Vec<(String, HealthOutcome)> {
        let mut targets = Vec::new();
        for descriptor in self.descriptors().await {
            if self.config.is_disabled(&descriptor.name) {
                continue;
            }
            if self
                .registry
                .state(&descriptor.name)
                .await
                .is_some_and(|s| s.is_probed())
            {
                targets.push(descriptor);
            }
        }

        join_all(targets.into_iter().map(|d| async move {
            let outcome = self.check_service(&d).await;
            (d.name.clone(), outcome)
        }))
        .await
    }

    /// Health loop. Returns only once the supervisor is stopped.
    pub async fn monitor_health(&self) {
        let interval = self.config.health_check_interval();
        info!("Health monitor started (interval: {:?})", interval);

        while self.sleep_while_running(interval).await {
            let pass = AssertUnwindSafe(self.health_pass()).catch_unwind().await;
            if pass.is_err() {
                error!("Health pass panicked, resuming after {:?}", interval);
            }
        }

        info!("Health monitor stopped");
    }

    /// Start, then monitor, forever. Failures restart the whole sequence
    /// after `startup_retry_delay`. Returns after `stop()`.
    pub async fn run_forever(&self) {
        let mut first = true;

        while self.is_running() {
            if !first {
                self.reset_for_retry().await;
            }
            first = false;

            let cycle = AssertUnwindSafe(async {
                self.start().await?;
                self.monitor_health().await;
                Ok::<(), ResolveError>(())
            })
            .catch_unwind()
            .await;

            if !self.is_running() {
                break;
            }

            match cycle {
                Ok(Ok(())) => warn!("Health monitor exited unexpectedly"),
                Ok(Err(e)) => error!("Supervisor startup failed: {}", e),
                Err(_) => error!("Supervisor panicked"),
            }

            let delay = self.config.startup_retry_delay();
            warn!("Restarting supervisor in {:?}", delay);
            self.sleep_while_running(delay).await;
        }
    }

    /// Stop the health loop and clean up every handle.
    pub async fn stop(&self) {
        info!("Stopping supervisor");
        self.running.send_replace(false);
        self.cleanup_handles(ServiceState::Stopped).await;
    }

    /// Tear down the previous cycle before `run_forever` starts again.
    ///
    /// Handles are cleaned up, services go back to `Registered` and every
    /// restart counter is zeroed.
    pub async fn reset_for_retry(&self) {
        self.cleanup_handles(ServiceState::Registered).await;
        self.attempts.reset_all();
    }

    async fn cleanup_handles(&self, state: ServiceState) {
        let handles = self.registry.drain_handles(state).await;
        join_all(handles.into_iter().map(|(name, handle)| async move {
            debug!("Cleaning up service '{}'", name);
            let cleanup = AssertUnwindSafe(handle.cleanup()).catch_unwind().await;
            if cleanup.is_err() {
                warn!("Cleanup of service '{}' panicked", name);
            }
        }))
        .await;
    }

    /// Snapshot of every registered service, in registration order.
    pub async fn list(&self) -> Vec<ServiceInfo> {
        let mut list = Vec::new();
        for descriptor in self.descriptors().await {
            if let Some(info) = self.registry.info(&descriptor.name).await {
                list.push(info);
            }
        }
        list
    }

    pub async fn info(&self, name: &str) -> Option<ServiceInfo> {
        self.registry.info(name).await
    }

    /// Sleep for `duration` unless stopped first. Returns whether still running.
    async fn sleep_while_running(&self, duration: Duration) -> bool {
        let mut running = self.running.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = async {
                let _ = running.wait_for(|running| !*running).await;
            } => {}
        }
        self.is_running()
    }
}
