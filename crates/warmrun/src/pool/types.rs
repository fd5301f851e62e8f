//! Internal data types for the container pool.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::{
    driver::ProcessHandle,
    error::InvocationError,
    function::{FunctionId, Language, PoolKey},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Start requested, not yet reported live.
    Starting,
    /// Live and idle.
    Ready,
    /// Leased to exactly one invocation.
    Busy,
    /// Out of the pool, waiting to be stopped.
    Dead,
}

/// A running instance. Owned by its slot; reachable only through the
/// slot's lock.
#[derive(Debug)]
pub(crate) struct ContainerInstance {
    pub key: PoolKey,
    pub handle: ProcessHandle,
    pub generation: u64,
    pub state: InstanceState,
    pub started_at: Instant,
    pub last_used_at: Instant,
    pub invocations: u64,
}

impl ContainerInstance {
    pub fn transition(&mut self, to: InstanceState) {
        tracing::debug!(
            instance = %self.handle.id,
            from = ?self.state,
            to = ?to,
            "Instance state transition"
        );
        self.state = to;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    pub fn view(&self) -> InstanceView {
        InstanceView {
            instance: self.handle.id.clone(),
            generation: self.generation,
            state: self.state,
            last_used_at: self.last_used_at,
            invocations: self.invocations,
        }
    }
}

/// Lock-free copy of an instance's observable fields, kept next to the
/// slot so snapshots never wait on a Busy instance.
#[derive(Debug, Clone)]
pub(crate) struct InstanceView {
    pub instance: String,
    pub generation: u64,
    pub state: InstanceState,
    pub last_used_at: Instant,
    pub invocations: u64,
}

/// How an invocation ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    /// The handler raised or returned unusable output. The instance is fine.
    HandlerError,
    Timeout,
    TransferFailure,
    /// The runtime failed to run the entrypoint at all.
    RuntimeFault,
}

impl ReleaseOutcome {
    /// Whether the instance must be discarded.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            ReleaseOutcome::Timeout | ReleaseOutcome::TransferFailure | ReleaseOutcome::RuntimeFault
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Success => "success",
            ReleaseOutcome::HandlerError => "handler_error",
            ReleaseOutcome::Timeout => "timeout",
            ReleaseOutcome::TransferFailure => "transfer_failure",
            ReleaseOutcome::RuntimeFault => "runtime_fault",
        }
    }
}

/// Why an instance left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Released(ReleaseOutcome),
    /// Dropped without an explicit release.
    Abandoned,
    IdleTimeout,
    HealthCheckFailed,
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Released(outcome) => outcome.as_str(),
            EvictionReason::Abandoned => "abandoned",
            EvictionReason::IdleTimeout => "idle_timeout",
            EvictionReason::HealthCheckFailed => "health_check_failed",
            EvictionReason::Shutdown => "shutdown",
        }
    }
}

/// A Dead instance waiting for the reaper to stop it.
#[derive(Debug)]
pub(crate) struct ReapRequest {
    pub key: PoolKey,
    pub handle: ProcessHandle,
    pub reason: EvictionReason,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("timed out after {}s waiting for an instance of {key}", .waited.as_secs_f64())]
    Timeout { key: PoolKey, waited: Duration },

    #[error("failed to start instance {name}: {source:#}")]
    StartFailure {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("pool is shutting down")]
    ShuttingDown,
}

impl From<AcquireError> for InvocationError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Timeout { .. } => InvocationError::Timeout {
                detail: err.to_string(),
            },
            AcquireError::StartFailure { .. } => InvocationError::ContainerStartFailure {
                reason: err.to_string(),
            },
            AcquireError::ShuttingDown => InvocationError::Internal {
                reason: err.to_string(),
            },
        }
    }
}

/// Counters and per-state instance counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub instances: usize,
    pub starting: usize,
    pub ready: usize,
    pub busy: usize,
    pub cold_starts: u64,
    pub warm_hits: u64,
    pub evictions: u64,
    pub start_failures: u64,
    pub pending_reaps: usize,
}

/// One pooled instance as reported by [`super::ContainerPool::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub function_id: FunctionId,
    pub language: Language,
    pub instance: String,
    pub generation: u64,
    pub state: InstanceState,
    pub idle_secs: f64,
    pub invocations: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub stats: PoolStats,
    pub instances: Vec<InstanceSnapshot>,
}
