//! Service Framework
//!
//! Reset operators, emitters and the fleet workers are all [`Service`]s. A
//! [`ServiceManager`] owns them, spawns each on its own task once the
//! services it depends on report healthy, and on shutdown broadcasts a stop
//! signal and joins every task against a single deadline.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

// ============================================================================
// Service Trait
// ============================================================================

/// A background loop driven by the manager
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Loop until a message (or close) arrives on `shutdown`
    async fn start(&self, shutdown: broadcast::Receiver<()>) -> Result<(), ServiceError>;

    /// Registry key, also used as the `service` log field
    fn name(&self) -> &'static str;

    fn status(&self) -> ServiceStatus;

    /// Names of services that must be healthy before this one is spawned
    fn dependencies(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

// ============================================================================
// Service Status
// ============================================================================

/// Lifecycle state reported by a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Constructed, loop not entered yet
    Starting,
    Running,
    /// Left the loop after a shutdown signal
    Stopped,
    Failed(String),
}

impl ServiceStatus {
    /// Only a running loop counts as healthy
    pub fn is_healthy(&self) -> bool {
        *self == ServiceStatus::Running
    }

    /// True once the loop has exited for any reason
    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceStatus::Stopped | ServiceStatus::Failed(_))
    }
}

// ============================================================================
// Service Error
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service failed: {0}")]
    Failed(String),

    #[error("unsatisfied dependency: {0}")]
    Dependency(String),

    #[error("a service named '{0}' is already registered")]
    DuplicateName(&'static str),

    #[error("services are already started")]
    AlreadyStarted,

    #[error("no service named '{0}'")]
    NotFound(String),
}

// ============================================================================
// Service Config
// ============================================================================

/// Manager timings
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Deadline shared by all tasks when joining on shutdown
    pub shutdown_timeout: Duration,

    /// Upper bound on waiting for a freshly spawned service to report Running
    pub startup_wait: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            startup_wait: Duration::from_millis(100),
        }
    }
}

// ============================================================================
// Service Manager
// ============================================================================

type ServiceTask = JoinHandle<Result<(), ServiceError>>;

struct Entry {
    service: Arc<dyn Service>,
    task: Option<ServiceTask>,
}

/// Owns the registered services and their tasks
pub struct ServiceManager {
    config: ServiceConfig,
    /// Keyed by name; ordered so start order is deterministic
    entries: RwLock<BTreeMap<&'static str, Entry>>,
    stop_tx: broadcast::Sender<()>,
    started: AtomicBool,
}

pub type SharedServiceManager = Arc<ServiceManager>;

impl ServiceManager {
    pub fn new(config: ServiceConfig) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            config,
            entries: RwLock::new(BTreeMap::new()),
            stop_tx,
            started: AtomicBool::new(false),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServiceConfig::default())
    }

    /// Add a service; names must be unique
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let name = service.name();
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(ServiceError::DuplicateName(name));
        }
        entries.insert(name, Entry { service, task: None });
        tracing::debug!(service = name, "Registered service");
        Ok(())
    }

    /// Spawn every registered service, dependencies first
    ///
    /// # Errors
    ///
    /// [`ServiceError::Dependency`] for an unregistered, cyclic, or unhealthy
    /// dependency; [`ServiceError::AlreadyStarted`] on a second call.
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        let order = self.start_order()?;

        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::AlreadyStarted);
        }

        for name in order {
            self.spawn(name).await?;
        }

        tracing::debug!("All services started");
        Ok(())
    }

    async fn spawn(&self, name: &'static str) -> Result<(), ServiceError> {
        let service = {
            let mut entries = self.entries.write();
            let service = entries
                .get(name)
                .map(|entry| Arc::clone(&entry.service))
                .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

            if let Some(dep) = service
                .dependencies()
                .into_iter()
                .find(|dep| !entries.get(dep).is_some_and(|e| e.service.status().is_healthy()))
            {
                return Err(ServiceError::Dependency(format!(
                    "'{}' needs '{}' running",
                    name, dep
                )));
            }

            let rx = self.stop_tx.subscribe();
            let runner = Arc::clone(&service);
            let task = tokio::spawn(async move { runner.start(rx).await });
            if let Some(entry) = entries.get_mut(name) {
                entry.task = Some(task);
            }
            service
        };

        let deadline = Instant::now() + self.config.startup_wait;
        while !service.status().is_healthy() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        tracing::debug!(service = name, status = ?service.status(), "Spawned service");
        Ok(())
    }

    /// Broadcast stop and join every task; tasks past the deadline are aborted
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        tracing::info!("Stopping background services");
        let _ = self.stop_tx.send(());

        let tasks: Vec<(&'static str, ServiceTask)> = self
            .entries
            .write()
            .iter_mut()
            .filter_map(|(name, entry)| entry.task.take().map(|task| (*name, task)))
            .collect();

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for (name, task) in tasks {
            let abort = task.abort_handle();
            match tokio::time::timeout_at(deadline, task).await {
                Ok(Ok(Ok(()))) => tracing::debug!(service = name, "Service stopped"),
                Ok(Ok(Err(e))) => tracing::warn!(service = name, error = %e, "Service exited with error"),
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service task panicked"),
                Err(_) => {
                    tracing::warn!(service = name, "Service missed the shutdown deadline, aborting");
                    abort.abort();
                },
            }
        }

        self.started.store(false, Ordering::Release);
        tracing::info!("Background services stopped");
        Ok(())
    }

    /// Status of every registered service
    pub fn status(&self) -> HashMap<&'static str, ServiceStatus> {
        self.entries
            .read()
            .iter()
            .map(|(name, entry)| (*name, entry.service.status()))
            .collect()
    }

    pub fn service_status(&self, name: &str) -> Option<ServiceStatus> {
        self.entries.read().get(name).map(|entry| entry.service.status())
    }

    /// True when every registered service is running
    pub fn is_healthy(&self) -> bool {
        self.entries
            .read()
            .values()
            .all(|entry| entry.service.status().is_healthy())
    }

    /// Topological order over declared dependencies (Kahn), ties by name
    fn start_order(&self) -> Result<Vec<&'static str>, ServiceError> {
        let entries = self.entries.read();

        let mut pending: BTreeMap<&'static str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();
        for (name, entry) in entries.iter() {
            let deps = entry.service.dependencies();
            if let Some(dep) = deps.iter().find(|dep| !entries.contains_key(*dep)) {
                return Err(ServiceError::Dependency(format!(
                    "'{}' depends on unregistered '{}'",
                    name, dep
                )));
            }
            pending.insert(*name, deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(*name);
            }
        }

        let mut order = Vec::with_capacity(pending.len());
        while let Some(name) = pending
            .iter()
            .find(|(_, &count)| count == 0)
            .map(|(name, _)| *name)
        {
            pending.remove(&name);
            order.push(name);
            for dependent in dependents.get(&name).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                }
            }
        }

        if !pending.is_empty() {
            let cycle: Vec<&str> = pending.keys().copied().collect();
            return Err(ServiceError::Dependency(format!(
                "dependency cycle among {}",
                cycle.join(", ")
            )));
        }
        Ok(order)
    }
}

// ============================================================================
// Tests
// ============================================================================
