mod docker;
mod fork_exec;

use std::{path::Path, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
pub use docker::DockerDriver;
pub use fork_exec::ForkExecDriver;

/// Label carried by every instance this service starts. Orphan cleanup
/// only ever touches instances carrying it.
pub const MANAGED_LABEL: &str = "warmrun.managed";

/// Prefix of every instance name.
pub const INSTANCE_NAME_PREFIX: &str = "warmrun-";

/// Resource limits for an instance.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Memory limit in bytes.
    pub memory_bytes: Option<u64>,
    /// CPU limit in millicores (1000 = 1 CPU core).
    pub cpu_millicores: Option<u64>,
}

/// Configuration for starting an instance.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Unique instance name. Starting twice with the same name returns the
    /// running instance or fails.
    pub name: String,
    /// Container image (Docker driver only).
    pub image: Option<String>,
    /// Host directory with the function code, exposed read-only to the
    /// instance.
    pub mount_source: std::path::PathBuf,
    /// Labels to attach to the instance.
    pub labels: Vec<(String, String)>,
    /// Environment variables for every exec in the instance.
    pub env: Vec<(String, String)>,
    pub resources: Option<ResourceLimits>,
}

/// Handle to a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Instance name (container name or scratch directory name).
    pub id: String,
    /// Where the entrypoint reads its payload, as seen from inside the
    /// instance.
    pub input_path: String,
    /// Where the function code is visible from inside the instance.
    pub function_dir: String,
}

/// Captured result of a completed exec.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The deadline elapsed. The in-flight execution has been killed.
    #[error("execution timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),

    /// The runtime could not run the command or collect its result.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Container runtime backend.
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    /// Start an instance. Idempotent by `config.name`.
    async fn start(&self, config: ProcessConfig) -> Result<ProcessHandle>;

    /// Copy the host file `local` to `remote` inside the instance.
    async fn transfer(&self, handle: &ProcessHandle, local: &Path, remote: &str) -> Result<()>;

    /// Run `command` inside the instance, killing it once `timeout` elapses.
    async fn exec(
        &self,
        handle: &ProcessHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError>;

    /// Stop and remove the instance. Stopping an unknown instance is not an
    /// error.
    async fn stop(&self, handle: &ProcessHandle) -> Result<()>;

    /// Liveness probe.
    async fn alive(&self, handle: &ProcessHandle) -> Result<bool>;

    /// All instances carrying [`MANAGED_LABEL`], running or not.
    async fn list_containers(&self) -> Result<Vec<ProcessHandle>>;
}
