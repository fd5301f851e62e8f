//! Warm container pool.
//!
//! At most one instance per [`PoolKey`]. Each key owns a slot guarded by a
//! fair async mutex: holding the lock is holding the instance, so waiters
//! on a Busy instance are served in arrival order and two invocations never
//! share an instance. The key to slot map sits behind a short sync lock
//! that is never held across an await.
//!
//! Instances leave the pool as Dead (released with a fatal outcome,
//! dropped without release, failed probe, idle past the TTL). A Dead
//! instance is taken out of its slot before the slot is unlocked, so the
//! next acquire starts a fresh generation; stopping it is left to the
//! reaper.

mod reaper;
mod types;

use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{Notify, OwnedMutexGuard},
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};
pub use types::{
    AcquireError,
    EvictionReason,
    InstanceSnapshot,
    InstanceState,
    PoolSnapshot,
    PoolStats,
    ReleaseOutcome,
};
use types::{ContainerInstance, InstanceView, ReapRequest};

use crate::{
    config::{PoolConfig, RuntimesConfig},
    driver::{
        INSTANCE_NAME_PREFIX,
        MANAGED_LABEL,
        ProcessConfig,
        ProcessDriver,
        ProcessHandle,
        ResourceLimits,
    },
    function::PoolKey,
    metrics::WarmrunMetrics,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

type InstanceGuard = OwnedMutexGuard<Option<ContainerInstance>>;

/// Per-key concurrency slot.
struct Slot {
    key: PoolKey,
    instance: Arc<tokio::sync::Mutex<Option<ContainerInstance>>>,
    view: Mutex<Option<InstanceView>>,
}

impl Slot {
    fn new(key: PoolKey) -> Self {
        Self {
            key,
            instance: Arc::new(tokio::sync::Mutex::new(None)),
            view: Mutex::new(None),
        }
    }

    fn publish(&self, instance: Option<&ContainerInstance>) {
        *self.view.lock() = instance.map(ContainerInstance::view);
    }

    fn publish_starting(&self, name: &str, generation: u64) {
        *self.view.lock() = Some(InstanceView {
            instance: name.to_string(),
            generation,
            state: InstanceState::Starting,
            last_used_at: Instant::now(),
            invocations: 0,
        });
    }

    fn view(&self) -> Option<InstanceView> {
        self.view.lock().clone()
    }
}

#[derive(Default)]
struct PoolCounters {
    cold_starts: AtomicU64,
    warm_hits: AtomicU64,
    evictions: AtomicU64,
    start_failures: AtomicU64,
}

struct PoolInner {
    driver: Arc<dyn ProcessDriver>,
    config: PoolConfig,
    runtimes: RuntimesConfig,
    slots: Mutex<HashMap<PoolKey, Arc<Slot>>>,
    dead: Mutex<Vec<ReapRequest>>,
    reap_notify: Notify,
    next_generation: AtomicU64,
    counters: PoolCounters,
    metrics: WarmrunMetrics,
    shutting_down: AtomicBool,
}

impl PoolInner {
    /// Take `instance` out of service and queue it for stopping. The caller
    /// has already removed it from `slot`.
    fn evict(&self, slot: &Slot, mut instance: ContainerInstance, reason: EvictionReason) {
        instance.transition(InstanceState::Dead);
        slot.publish(None);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_eviction(&instance.key, reason.as_str());
        info!(
            function_id = instance.key.function_id,
            language = %instance.key.language,
            instance = %instance.handle.id,
            reason = reason.as_str(),
            invocations = instance.invocations,
            uptime_secs = instance.started_at.elapsed().as_secs(),
            "Instance evicted"
        );
        self.schedule_stop(instance.key, instance.handle, reason);
    }

    fn schedule_stop(&self, key: PoolKey, handle: ProcessHandle, reason: EvictionReason) {
        self.dead.lock().push(ReapRequest {
            key,
            handle,
            reason,
        });
        self.reap_notify.notify_one();
    }

    /// Return a leased instance to its slot.
    fn finish(&self, slot: &Slot, mut guard: InstanceGuard, outcome: Option<ReleaseOutcome>) {
        let eviction = match outcome {
            Some(outcome) if outcome.is_dead() => Some(EvictionReason::Released(outcome)),
            Some(_) => None,
            None => Some(EvictionReason::Abandoned),
        };

        match eviction {
            None => {
                if let Some(instance) = guard.as_mut() {
                    instance.last_used_at = Instant::now();
                    instance.transition(InstanceState::Ready);
                    slot.publish(Some(instance));
                }
            }
            Some(reason) => {
                if let Some(instance) = guard.take() {
                    self.evict(slot, instance, reason);
                }
            }
        }
        // Unlocking hands the slot to the next waiter.
        drop(guard);
    }
}

/// Exclusive use of one instance. Release it with
/// [`ContainerPool::release`]; dropping it unreleased discards the instance.
pub struct Lease {
    pool: Arc<PoolInner>,
    slot: Arc<Slot>,
    guard: Option<InstanceGuard>,
    handle: ProcessHandle,
    generation: u64,
    cold_start: bool,
}

impl Lease {
    pub fn key(&self) -> PoolKey {
        self.slot.key
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether acquiring this lease started the instance.
    pub fn cold_start(&self) -> bool {
        self.cold_start
    }

    fn finish(&mut self, outcome: Option<ReleaseOutcome>) {
        if let Some(guard) = self.guard.take() {
            self.pool.finish(&self.slot, guard, outcome);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.guard.is_some() {
            warn!(
                instance = %self.handle.id,
                "Lease dropped without release, discarding instance"
            );
            self.finish(None);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.slot.key)
            .field("instance", &self.handle.id)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Clone)]
pub struct ContainerPool {
    inner: Arc<PoolInner>,
}

impl ContainerPool {
    pub fn new(
        driver: Arc<dyn ProcessDriver>,
        config: PoolConfig,
        runtimes: RuntimesConfig,
        metrics: WarmrunMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                runtimes,
                slots: Mutex::new(HashMap::new()),
                dead: Mutex::new(Vec::new()),
                reap_notify: Notify::new(),
                next_generation: AtomicU64::new(0),
                counters: PoolCounters::default(),
                metrics,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    fn slot(&self, key: PoolKey) -> Arc<Slot> {
        self.inner
            .slots
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(Slot::new(key)))
            .clone()
    }

    /// Check out the instance for `key`, starting one if needed.
    ///
    /// Waits for a Busy instance in FIFO order. Every wait, including the
    /// cold start, is bounded by `deadline`.
    pub async fn acquire(
        &self,
        key: PoolKey,
        mount_source: &Path,
        deadline: Instant,
    ) -> Result<Lease, AcquireError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(AcquireError::ShuttingDown);
        }

        let arrived = Instant::now();
        let slot = self.slot(key);
        let mut guard = timeout_at(deadline, slot.instance.clone().lock_owned())
            .await
            .map_err(|_| AcquireError::Timeout {
                key,
                waited: arrived.elapsed(),
            })?;

        if self.verify_warm(&slot, &mut guard, deadline, arrived).await? &&
            let Some(instance) = guard.as_mut()
        {
            instance.transition(InstanceState::Busy);
            instance.invocations += 1;
            slot.publish(Some(instance));
            let handle = instance.handle.clone();
            let generation = instance.generation;

            self.inner.counters.warm_hits.fetch_add(1, Ordering::Relaxed);
            self.inner.metrics.record_warm_hit(&key);
            self.inner.metrics.record_acquire_wait(&key, arrived.elapsed());
            debug!(instance = %handle.id, "Warm instance acquired");
            return Ok(self.lease(slot, guard, handle, generation, false));
        }
        self.cold_start(slot, guard, mount_source, deadline, arrived)
            .await
    }

    /// Probe the slot's Ready instance when configured to. A failed probe
    /// evicts it and leaves the slot empty for a cold start.
    async fn verify_warm(
        &self,
        slot: &Slot,
        guard: &mut InstanceGuard,
        deadline: Instant,
        arrived: Instant,
    ) -> Result<bool, AcquireError> {
        let Some(instance) = guard.as_ref() else {
            return Ok(false);
        };
        if !self.inner.config.verify_on_acquire {
            return Ok(true);
        }

        let healthy = match timeout_at(deadline, self.inner.driver.alive(&instance.handle)).await {
            Ok(Ok(alive)) => alive,
            Ok(Err(e)) => {
                warn!(instance = %instance.handle.id, error = %e, "Liveness probe failed");
                false
            }
            Err(_) => {
                return Err(AcquireError::Timeout {
                    key: slot.key,
                    waited: arrived.elapsed(),
                });
            }
        };
        if !healthy && let Some(instance) = guard.take() {
            self.inner
                .evict(slot, instance, EvictionReason::HealthCheckFailed);
        }
        Ok(healthy)
    }

    fn lease(
        &self,
        slot: Arc<Slot>,
        guard: InstanceGuard,
        handle: ProcessHandle,
        generation: u64,
        cold_start: bool,
    ) -> Lease {
        Lease {
            pool: self.inner.clone(),
            slot,
            guard: Some(guard),
            handle,
            generation,
            cold_start,
        }
    }

    async fn cold_start(
        &self,
        slot: Arc<Slot>,
        mut guard: InstanceGuard,
        mount_source: &Path,
        deadline: Instant,
        arrived: Instant,
    ) -> Result<Lease, AcquireError> {
        let key = slot.key;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!(
            "{}{}-{}-{}",
            INSTANCE_NAME_PREFIX, key.language, key.function_id, generation
        );
        slot.publish_starting(&name, generation);

        let runtime = self.inner.runtimes.get(key.language);
        let resources = (runtime.memory_bytes.is_some() || runtime.cpu_millicores.is_some())
            .then(|| ResourceLimits {
                memory_bytes: runtime.memory_bytes,
                cpu_millicores: runtime.cpu_millicores,
            });
        let config = ProcessConfig {
            name: name.clone(),
            image: runtime.image.clone(),
            mount_source: mount_source.to_path_buf(),
            labels: vec![
                (MANAGED_LABEL.to_string(), "true".to_string()),
                ("warmrun.function_id".to_string(), key.function_id.to_string()),
                ("warmrun.language".to_string(), key.language.to_string()),
                ("warmrun.generation".to_string(), generation.to_string()),
            ],
            env: vec![],
            resources,
        };

        info!(
            function_id = key.function_id,
            language = %key.language,
            instance = %name,
            "Starting instance"
        );

        let handle = match timeout_at(deadline, self.inner.driver.start(config)).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                slot.publish(None);
                self.record_start_failure(key);
                return Err(AcquireError::StartFailure { name, source });
            }
            Err(_) => {
                // The runtime may still finish creating it.
                slot.publish(None);
                self.inner.schedule_stop(
                    key,
                    ProcessHandle {
                        id: name,
                        input_path: String::new(),
                        function_dir: String::new(),
                    },
                    EvictionReason::Released(ReleaseOutcome::Timeout),
                );
                return Err(AcquireError::Timeout {
                    key,
                    waited: arrived.elapsed(),
                });
            }
        };

        let now = Instant::now();
        let mut instance = ContainerInstance {
            key,
            handle,
            generation,
            state: InstanceState::Starting,
            started_at: now,
            last_used_at: now,
            invocations: 0,
        };

        let ready_deadline = deadline.min(now + self.inner.config.ready_timeout);
        if let Err(err) = self.wait_ready(&instance.handle, ready_deadline).await {
            let err = match err {
                ReadyError::Deadline if ready_deadline == deadline => AcquireError::Timeout {
                    key,
                    waited: arrived.elapsed(),
                },
                ReadyError::Deadline => AcquireError::StartFailure {
                    name: name.clone(),
                    source: anyhow::anyhow!(
                        "instance not live within {}s",
                        self.inner.config.ready_timeout.as_secs()
                    ),
                },
                ReadyError::Probe(source) => AcquireError::StartFailure {
                    name: name.clone(),
                    source,
                },
            };
            if matches!(err, AcquireError::StartFailure { .. }) {
                self.record_start_failure(key);
            }
            self.inner.evict(
                &slot,
                instance,
                EvictionReason::Released(ReleaseOutcome::RuntimeFault),
            );
            return Err(err);
        }

        instance.transition(InstanceState::Ready);
        instance.transition(InstanceState::Busy);
        instance.invocations = 1;
        let handle = instance.handle.clone();
        slot.publish(Some(&instance));
        *guard = Some(instance);

        self.inner.counters.cold_starts.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.record_cold_start(&key);
        self.inner.metrics.record_acquire_wait(&key, arrived.elapsed());
        info!(
            function_id = key.function_id,
            language = %key.language,
            instance = %handle.id,
            startup_ms = now.elapsed().as_millis() as u64,
            "Instance ready"
        );

        Ok(self.lease(slot, guard, handle, generation, true))
    }

    fn record_start_failure(&self, key: PoolKey) {
        self.inner
            .counters
            .start_failures
            .fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.record_start_failure(&key);
    }

    /// Poll the driver until the instance reports live.
    async fn wait_ready(&self, handle: &ProcessHandle, deadline: Instant) -> Result<(), ReadyError> {
        loop {
            match timeout_at(deadline, self.inner.driver.alive(handle)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => return Err(ReadyError::Probe(e)),
                Err(_) => return Err(ReadyError::Deadline),
            }
            if Instant::now() + READY_POLL_INTERVAL >= deadline {
                return Err(ReadyError::Deadline);
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Return `lease` to the pool. Fatal outcomes discard the instance.
    pub fn release(&self, mut lease: Lease, outcome: ReleaseOutcome) {
        debug!(
            instance = %lease.handle.id,
            outcome = outcome.as_str(),
            "Releasing instance"
        );
        lease.finish(Some(outcome));
    }

    pub fn stats(&self) -> PoolStats {
        let views: Vec<InstanceView> = self
            .inner
            .slots
            .lock()
            .values()
            .filter_map(|slot| slot.view())
            .collect();

        let count = |state: InstanceState| views.iter().filter(|v| v.state == state).count();
        let counters = &self.inner.counters;
        PoolStats {
            instances: views.len(),
            starting: count(InstanceState::Starting),
            ready: count(InstanceState::Ready),
            busy: count(InstanceState::Busy),
            cold_starts: counters.cold_starts.load(Ordering::Relaxed),
            warm_hits: counters.warm_hits.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            start_failures: counters.start_failures.load(Ordering::Relaxed),
            pending_reaps: self.inner.dead.lock().len(),
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let now = Instant::now();
        let mut instances: Vec<InstanceSnapshot> = self
            .inner
            .slots
            .lock()
            .values()
            .filter_map(|slot| {
                slot.view().map(|view| InstanceSnapshot {
                    function_id: slot.key.function_id,
                    language: slot.key.language,
                    instance: view.instance,
                    generation: view.generation,
                    state: view.state,
                    idle_secs: match view.state {
                        InstanceState::Ready => {
                            now.saturating_duration_since(view.last_used_at).as_secs_f64()
                        }
                        _ => 0.0,
                    },
                    invocations: view.invocations,
                })
            })
            .collect();
        instances.sort_by_key(|i| (i.function_id, i.language));

        PoolSnapshot {
            stats: self.stats(),
            instances,
        }
    }

    /// Instance state for `key`, if the pool holds one.
    pub fn state_of(&self, key: PoolKey) -> Option<InstanceState> {
        let slot = self.inner.slots.lock().get(&key).cloned()?;
        slot.view().map(|v| v.state)
    }
}

enum ReadyError {
    Deadline,
    Probe(anyhow::Error),
}
