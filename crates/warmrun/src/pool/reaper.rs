//! Background eviction: idle TTL, liveness probes, stopping Dead instances,
//! orphan cleanup and shutdown.

use std::{
    collections::HashSet,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use futures_util::future::join_all;
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ContainerPool, EvictionReason, InstanceState, Slot};

/// Upper bound on one liveness probe. A probe that does not answer counts
/// as failed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

impl ContainerPool {
    /// Run the reaper loop. Call this from a spawned task.
    pub async fn run_reaper(&self, cancel_token: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.reap_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Reaper loop cancelled");
                    return;
                }
                _ = interval.tick() => {
                    self.reap().await;
                }
                _ = self.inner.reap_notify.notified() => {
                    self.drain_dead().await;
                }
            }
        }
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        self.inner.slots.lock().values().cloned().collect()
    }

    /// One sweep: evict idle and unhealthy instances, then stop everything
    /// Dead. Busy and Starting instances are skipped. Returns the number of
    /// instances stopped.
    ///
    /// Liveness probes run with the slot unlocked, so an acquire never
    /// waits on a probe.
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let idle_ttl = self.inner.config.idle_ttl;

        let mut to_probe = Vec::new();
        for slot in self.slots() {
            // Locked means Busy, Starting, or an acquire in progress.
            let Ok(mut guard) = slot.instance.clone().try_lock_owned() else {
                continue;
            };
            let Some(instance) = guard.as_ref() else {
                continue;
            };

            if instance.idle_for(now) >= idle_ttl {
                if let Some(instance) = guard.take() {
                    self.inner
                        .evict(&slot, instance, EvictionReason::IdleTimeout);
                }
            } else {
                let (handle, generation) = (instance.handle.clone(), instance.generation);
                to_probe.push((slot.clone(), handle, generation));
            }
        }

        let probes = to_probe.into_iter().map(|(slot, handle, generation)| async move {
            let healthy = match timeout(PROBE_TIMEOUT, self.inner.driver.alive(&handle)).await {
                Ok(Ok(alive)) => alive,
                Ok(Err(e)) => {
                    warn!(instance = %handle.id, error = %e, "Liveness probe failed");
                    false
                }
                Err(_) => {
                    warn!(instance = %handle.id, "Liveness probe timed out");
                    false
                }
            };
            (slot, generation, healthy)
        });

        for (slot, generation, healthy) in join_all(probes).await {
            if healthy {
                continue;
            }
            // Leased again since the probe started: the lease will find out.
            let Ok(mut guard) = slot.instance.clone().try_lock_owned() else {
                continue;
            };
            let same_instance = guard.as_ref().is_some_and(|instance| {
                instance.generation == generation && instance.state == InstanceState::Ready
            });
            if same_instance && let Some(instance) = guard.take() {
                self.inner
                    .evict(&slot, instance, EvictionReason::HealthCheckFailed);
            }
        }

        self.prune_empty_slots();
        self.drain_dead().await
    }

    /// Drop map entries nobody holds and that carry no instance.
    fn prune_empty_slots(&self) {
        self.inner
            .slots
            .lock()
            .retain(|_, slot| Arc::strong_count(slot) > 1 || slot.view().is_some());
    }

    /// Stop every queued Dead instance. Returns the number stopped.
    pub async fn drain_dead(&self) -> usize {
        let requests = std::mem::take(&mut *self.inner.dead.lock());
        let mut stopped = 0;
        for request in requests {
            match self.inner.driver.stop(&request.handle).await {
                Ok(()) => {
                    stopped += 1;
                    info!(
                        function_id = request.key.function_id,
                        language = %request.key.language,
                        instance = %request.handle.id,
                        reason = request.reason.as_str(),
                        "Instance stopped"
                    );
                }
                Err(e) => warn!(
                    instance = %request.handle.id,
                    error = ?e,
                    "Failed to stop instance"
                ),
            }
        }
        stopped
    }

    /// Stop managed instances the pool does not own, e.g. left behind by a
    /// previous run. Returns the number stopped.
    pub async fn cleanup_orphans(&self) -> usize {
        let known: HashSet<String> = self
            .slots()
            .iter()
            .filter_map(|slot| slot.view().map(|view| view.instance))
            .collect();

        let all_containers = match self.inner.driver.list_containers().await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Failed to list instances for orphan cleanup");
                return 0;
            }
        };

        let mut cleaned = 0;
        for handle in all_containers {
            if known.contains(&handle.id) {
                continue;
            }
            info!(instance = %handle.id, "Removing orphaned instance");
            if let Err(e) = self.inner.driver.stop(&handle).await {
                warn!(instance = %handle.id, error = %e, "Failed to remove orphaned instance");
            } else {
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Refuse new acquires, stop every idle instance and drain the reap
    /// queue. Busy instances are left to their leases.
    pub async fn shutdown(&self) -> usize {
        self.inner.shutting_down.store(true, Ordering::Release);

        for slot in self.slots() {
            let Ok(mut guard) = slot.instance.clone().try_lock_owned() else {
                warn!(key = %slot.key, "Instance busy at shutdown, skipping");
                continue;
            };
            if let Some(instance) = guard.take() {
                self.inner.evict(&slot, instance, EvictionReason::Shutdown);
            }
        }

        let stopped = self.drain_dead().await;
        info!(stopped = stopped, "Pool shut down");
        stopped
    }
}
