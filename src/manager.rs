use crate::config::Config;
use crate::error::InstanceError;
use crate::launcher::{BackendLauncher, ProcessHandle, ProcessLauncher};
use crate::pool::ConnectionPool;
use crate::port::{OsPortAllocator, PortAllocator};
use crate::probe::{HttpHealthCheck, ProbeConfig, ReadinessProber, TokioClock};
use crate::tenant::TenantId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Steps of a single creation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStage {
    Requested,
    PortAllocated,
    Launched,
    Probing,
    Ready,
    Failed,
}

/// One running backend bound to one tenant
pub struct Instance {
    tenant: TenantId,
    port: u16,
    /// Taken out on termination
    handle: Mutex<Option<ProcessHandle>>,
    ready: AtomicBool,
    created_at: Instant,
}

impl Instance {
    fn new(tenant: TenantId, port: u16, handle: Option<ProcessHandle>) -> Self {
        Self {
            tenant,
            port,
            handle: Mutex::new(handle),
            ready: AtomicBool::new(true),
            created_at: Instant::now(),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// True from publication until `terminate` is called
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// OS process id for process-backed instances
    pub fn pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().and_then(ProcessHandle::id)
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Stop the backend. Idempotent.
    pub async fn terminate(&self, grace_period: Duration) {
        self.ready.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        if let Some(mut handle) = handle {
            handle.terminate(self.tenant.as_str(), grace_period).await;
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("tenant", &self.tenant)
            .field("port", &self.port)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Creation counters
#[derive(Debug, Default)]
pub struct ManagerStats {
    /// Creation sequences started
    pub attempts: AtomicU64,
    /// Instances published to the registry
    pub created: AtomicU64,
    /// Creation sequences that ended in an error
    pub failed: AtomicU64,
}

impl ManagerStats {
    pub fn get_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn get_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Status information for one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    pub tenant: TenantId,
    pub port: u16,
    pub pid: Option<u32>,
    pub ready: bool,
}

/// Registry of running instances keyed by tenant.
///
/// # Concurrency
///
/// Lookups share a read lock. A cold start holds the write lock for the whole
/// sequence (allocate, launch, probe, insert), so cold starts are serialized
/// globally and two instances for one tenant can never exist. The probe is
/// bounded, which bounds how long other tenants' cold starts wait.
///
/// `new` returns `Arc<Self>`; the manager is built once at startup and shared
/// with every connection task.
pub struct InstanceManager {
    instances: RwLock<HashMap<TenantId, Arc<Instance>>>,
    allocator: Arc<dyn PortAllocator>,
    launcher: Arc<dyn BackendLauncher>,
    prober: ReadinessProber,
    grace_period: Duration,
    stats: ManagerStats,
}

impl InstanceManager {
    pub fn new(
        allocator: Arc<dyn PortAllocator>,
        launcher: Arc<dyn BackendLauncher>,
        prober: ReadinessProber,
        grace_period: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            instances: RwLock::new(HashMap::new()),
            allocator,
            launcher,
            prober,
            grace_period,
            stats: ManagerStats::default(),
        })
    }

    /// Wire up OS port allocation, process launching and HTTP probing from config
    pub fn from_config(config: &Config, pool: Arc<ConnectionPool>) -> anyhow::Result<Arc<Self>> {
        let backend = &config.backend;
        let ip: IpAddr = match backend.host.as_str() {
            "localhost" => IpAddr::from([127, 0, 0, 1]),
            host => host.parse().map_err(|e| {
                anyhow::anyhow!("backend.host '{}' is not an IP address: {}", host, e)
            })?,
        };

        let prober = ReadinessProber::new(
            ProbeConfig {
                health_path: backend.health_path.clone(),
                max_attempts: backend.probe_attempts,
                interval: backend.probe_interval(),
            },
            Arc::new(HttpHealthCheck::new(pool, backend.probe_timeout())),
            Arc::new(TokioClock),
        );

        Ok(Self::new(
            Arc::new(OsPortAllocator::new(ip)),
            Arc::new(ProcessLauncher::new(backend.clone())),
            prober,
            backend.shutdown_grace_period(),
        ))
    }

    pub fn stats(&self) -> &ManagerStats {
        &self.stats
    }

    /// Look up an existing instance without creating one
    pub async fn get(&self, tenant: &TenantId) -> Option<Arc<Instance>> {
        self.instances.read().await.get(tenant).cloned()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Return the tenant's instance, creating and probing it on first use.
    ///
    /// On error nothing is registered and the next call starts over.
    pub async fn get_or_create(&self, tenant: &TenantId) -> Result<Arc<Instance>, InstanceError> {
        if let Some(instance) = self.instances.read().await.get(tenant) {
            return Ok(Arc::clone(instance));
        }

        let mut instances = self.instances.write().await;

        // Another request may have finished creating it while we waited for the lock
        if let Some(instance) = instances.get(tenant) {
            debug!(tenant = %tenant, "Instance appeared while waiting for registry lock");
            return Ok(Arc::clone(instance));
        }

        self.stats.attempts.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        match self.create(tenant).await {
            Ok(instance) => {
                instances.insert(tenant.clone(), Arc::clone(&instance));
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                info!(
                    tenant = %tenant,
                    port = instance.port(),
                    cold_start_ms = started.elapsed().as_millis() as u64,
                    instances = instances.len(),
                    "Instance ready"
                );
                Ok(instance)
            }
            Err((stage, e)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    tenant = %tenant,
                    ?stage,
                    kind = e.kind(),
                    error = %e,
                    "Instance creation failed"
                );
                Err(e)
            }
        }
    }

    /// The creation sequence. Caller holds the registry write lock.
    async fn create(
        &self,
        tenant: &TenantId,
    ) -> Result<Arc<Instance>, (CreationStage, InstanceError)> {
        transition(tenant, CreationStage::Requested);

        let port = self
            .allocator
            .allocate()
            .map_err(|e| (CreationStage::Requested, e))?;
        transition(tenant, CreationStage::PortAllocated);

        let handle = self
            .launcher
            .launch(tenant, port)
            .map_err(|e| (CreationStage::PortAllocated, e))?;
        // From here on, bailing out (error or cancelled future) stops the backend
        let mut pending = PendingBackend::new(tenant.clone(), handle, self.grace_period);
        transition(tenant, CreationStage::Launched);

        transition(tenant, CreationStage::Probing);
        match pending.wait_ready(&self.prober, port).await {
            Ok(attempts) => {
                debug!(tenant = %tenant, port, attempts, "Readiness probe succeeded");
            }
            Err(e) => {
                transition(tenant, CreationStage::Failed);
                return Err((CreationStage::Probing, e));
            }
        }

        transition(tenant, CreationStage::Ready);
        Ok(Arc::new(Instance::new(tenant.clone(), port, pending.publish())))
    }

    /// Snapshot of all registered instances, sorted by tenant
    pub async fn list(&self) -> Vec<InstanceStatus> {
        let instances = self.instances.read().await;
        let mut statuses: Vec<InstanceStatus> = instances
            .values()
            .map(|instance| InstanceStatus {
                tenant: instance.tenant().clone(),
                port: instance.port(),
                pid: instance.pid(),
                ready: instance.is_ready(),
            })
            .collect();
        statuses.sort_by(|a, b| a.tenant.cmp(&b.tenant));
        statuses
    }

    /// Unregister and terminate every instance
    pub async fn stop_all(&self) {
        let drained: Vec<Arc<Instance>> = {
            let mut instances = self.instances.write().await;
            instances.drain().map(|(_, instance)| instance).collect()
        };

        if drained.is_empty() {
            return;
        }

        info!(count = drained.len(), "Stopping all instances");
        for instance in drained {
            debug!(
                tenant = %instance.tenant(),
                uptime_secs = instance.uptime().as_secs(),
                "Stopping instance"
            );
            instance.terminate(self.grace_period).await;
        }
    }
}

/// A launched backend that has not been published to the registry yet.
///
/// Dropping it terminates the backend in a background task, so the registry
/// lock is not held through the grace period.
struct PendingBackend {
    tenant: TenantId,
    handle: Option<ProcessHandle>,
    grace_period: Duration,
}

impl PendingBackend {
    fn new(tenant: TenantId, handle: ProcessHandle, grace_period: Duration) -> Self {
        Self {
            tenant,
            handle: Some(handle),
            grace_period,
        }
    }

    async fn wait_ready(
        &mut self,
        prober: &ReadinessProber,
        port: u16,
    ) -> Result<u32, InstanceError> {
        match self.handle.as_mut() {
            Some(handle) => prober.wait_ready(port, handle).await,
            None => Err(InstanceError::NotReady {
                port,
                attempts: 0,
                reason: "backend handle already released".to_string(),
            }),
        }
    }

    /// Hand the backend over to its instance
    fn publish(mut self) -> Option<ProcessHandle> {
        self.handle.take()
    }
}

impl Drop for PendingBackend {
    fn drop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        warn!(tenant = %self.tenant, "Discarding backend that never became ready");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let tenant = self.tenant.to_string();
                let grace_period = self.grace_period;
                runtime.spawn(async move {
                    handle.terminate(&tenant, grace_period).await;
                });
            }
            Err(_) => handle.kill_now(),
        }
    }
}

fn transition(tenant: &TenantId, stage: CreationStage) {
    match stage {
        CreationStage::Failed => warn!(tenant = %tenant, ?stage, "Creation stage"),
        _ => debug!(tenant = %tenant, ?stage, "Creation stage"),
    }
}
