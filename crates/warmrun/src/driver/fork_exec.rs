use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use super::{
    ExecError,
    ExecOutput,
    INSTANCE_NAME_PREFIX,
    ProcessConfig,
    ProcessDriver,
    ProcessHandle,
};

const INPUT_FILE: &str = "input.json";

/// A local instance: a scratch directory plus the environment each exec
/// inherits.
#[derive(Debug, Clone)]
struct LocalInstance {
    dir: PathBuf,
    env: Vec<(String, String)>,
}

/// Runs instances as plain host processes. Each instance owns a scratch
/// directory under `instances_dir`; every exec spawns in its own process
/// group so a timeout can kill the whole tree.
pub struct ForkExecDriver {
    instances_dir: PathBuf,
    instances: Arc<Mutex<HashMap<String, LocalInstance>>>,
}

impl ForkExecDriver {
    pub fn new(instances_dir: impl Into<PathBuf>) -> Self {
        Self {
            instances_dir: instances_dir.into(),
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handle_for(&self, name: &str, function_dir: &Path) -> ProcessHandle {
        ProcessHandle {
            id: name.to_string(),
            input_path: self
                .instances_dir
                .join(name)
                .join(INPUT_FILE)
                .to_string_lossy()
                .into_owned(),
            function_dir: function_dir.to_string_lossy().into_owned(),
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid = pid, error = %e, "Failed to kill process group"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[async_trait]
impl ProcessDriver for ForkExecDriver {
    async fn start(&self, config: ProcessConfig) -> Result<ProcessHandle> {
        let mut instances = self.instances.lock().await;
        if let Some(existing) = instances.get(&config.name) &&
            existing.dir.is_dir()
        {
            debug!(instance = %config.name, "Instance already running");
            return Ok(self.handle_for(&config.name, &config.mount_source));
        }

        if !config.mount_source.is_dir() {
            anyhow::bail!(
                "function directory {} does not exist",
                config.mount_source.display()
            );
        }

        let dir = self.instances_dir.join(&config.name);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create instance dir {}", dir.display()))?;

        info!(
            instance = %config.name,
            dir = %dir.display(),
            function_dir = %config.mount_source.display(),
            "Local instance started (ignoring image: {:?})",
            config.image
        );

        instances.insert(
            config.name.clone(),
            LocalInstance {
                dir,
                env: config.env,
            },
        );
        Ok(self.handle_for(&config.name, &config.mount_source))
    }

    async fn transfer(&self, handle: &ProcessHandle, local: &Path, remote: &str) -> Result<()> {
        if !self.instances.lock().await.contains_key(&handle.id) {
            anyhow::bail!("instance {} is not running", handle.id);
        }
        tokio::fs::copy(local, remote)
            .await
            .with_context(|| format!("Failed to copy {} to {}", local.display(), remote))?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &ProcessHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        let instance = self
            .instances
            .lock()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("instance {} is not running", handle.id))?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("empty exec command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(instance.env)
            .current_dir(&instance.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", program))?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output.context("Failed to collect exec output")?;
                Ok(ExecOutput {
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.status.code().map(i64::from),
                })
            }
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                Err(ExecError::TimedOut(timeout))
            }
        }
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.instances.lock().await.remove(&handle.id);
        let dir = self.instances_dir.join(&handle.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }

    async fn alive(&self, handle: &ProcessHandle) -> Result<bool> {
        let instances = self.instances.lock().await;
        Ok(instances
            .get(&handle.id)
            .is_some_and(|instance| instance.dir.is_dir()))
    }

    async fn list_containers(&self) -> Result<Vec<ProcessHandle>> {
        let mut entries = match tokio::fs::read_dir(&self.instances_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e).context("Failed to list instances dir"),
        };

        let mut handles = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(INSTANCE_NAME_PREFIX) && entry.file_type().await?.is_dir() {
                handles.push(self.handle_for(&name, Path::new("")));
            }
        }
        Ok(handles)
    }
}
