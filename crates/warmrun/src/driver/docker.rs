use std::{collections::HashMap, path::Path, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::{
    Docker,
    body_full,
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerCreateBody, HostConfig},
    query_parameters::{
        CreateContainerOptions,
        InspectContainerOptions,
        KillContainerOptions,
        ListContainersOptions,
        RemoveContainerOptions,
        StartContainerOptions,
        UploadToContainerOptions,
    },
};
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info, warn};
use warmrun_entrypoint::protocol::{FUNCTION_DIR, INPUT_PATH};

use super::{
    ExecError,
    ExecOutput,
    MANAGED_LABEL,
    ProcessConfig,
    ProcessDriver,
    ProcessHandle,
    ResourceLimits,
};

pub struct DockerDriver {
    docker: Docker,
    network: Option<String>,
    idle_command: Vec<String>,
}

fn is_status(err: &bollard::errors::Error, code: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == code
    )
}

impl DockerDriver {
    /// Connect to `address`, or to Docker's default socket location.
    ///
    /// Supported address formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    pub fn new(
        address: Option<&str>,
        network: Option<String>,
        idle_command: Vec<String>,
    ) -> Result<Self> {
        let docker = match address {
            None => Docker::connect_with_local_defaults()
                .context("Failed to connect to Docker daemon")?,
            Some(address) if address.starts_with("http://") || address.starts_with("tcp://") => {
                let addr = address
                    .trim_start_matches("http://")
                    .trim_start_matches("tcp://");
                Docker::connect_with_http(
                    &format!("http://{}", addr),
                    120,
                    bollard::API_DEFAULT_VERSION,
                )
                .context("Failed to connect to Docker daemon via HTTP")?
            }
            Some(address) => {
                let socket_path = address.trim_start_matches("unix://");
                Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                    .context("Failed to connect to Docker daemon via Unix socket")?
            }
        };
        Ok(Self {
            docker,
            network,
            idle_command,
        })
    }

    fn handle_for(name: &str) -> ProcessHandle {
        ProcessHandle {
            id: name.to_string(),
            input_path: INPUT_PATH.to_string(),
            function_dir: FUNCTION_DIR.to_string(),
        }
    }

    /// Running state of `name`, or `None` when no such container exists.
    async fn running(&self, name: &str) -> Result<Option<bool>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(
                inspect.state.and_then(|s| s.running).unwrap_or(false),
            )),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e).context("Failed to inspect container"),
        }
    }

    async fn kill(&self, name: &str) {
        if let Err(e) = self
            .docker
            .kill_container(
                name,
                Some(KillContainerOptions {
                    signal: "SIGKILL".to_string(),
                }),
            )
            .await
        {
            debug!(container = %name, error = %e, "Kill failed");
        }
    }

    async fn run_exec(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .context("Failed to create exec")?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .context("Failed to start exec")?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.context("Failed to read exec output")? {
                        bollard::container::LogOutput::StdOut { message } => {
                            stdout.extend_from_slice(&message)
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            stderr.extend_from_slice(&message)
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => anyhow::bail!("exec started detached"),
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context("Failed to inspect exec")?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }
}

fn build_resource_limits(resources: &Option<ResourceLimits>) -> (Option<i64>, Option<i64>) {
    let Some(resources) = resources else {
        return (None, None);
    };
    // Docker uses nano CPUs (1 CPU = 1e9 nano CPUs).
    (
        resources.memory_bytes.map(|bytes| bytes as i64),
        resources
            .cpu_millicores
            .map(|millicores| millicores as i64 * 1_000_000),
    )
}

/// Single-entry tar archive placing `data` at `file_name`.
fn single_file_tar(file_name: &str, data: &[u8]) -> Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, data)
        .context("Failed to build payload archive")?;
    builder
        .into_inner()
        .context("Failed to finish payload archive")
}

#[async_trait]
impl ProcessDriver for DockerDriver {
    async fn start(&self, config: ProcessConfig) -> Result<ProcessHandle> {
        let image = config
            .image
            .as_ref()
            .context("Docker driver requires an image")?;

        let (memory, nano_cpus) = build_resource_limits(&config.resources);
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let mut labels: HashMap<String, String> = config.labels.iter().cloned().collect();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:ro",
                config.mount_source.display(),
                FUNCTION_DIR
            )]),
            memory,
            nano_cpus,
            network_mode: self.network.clone(),
            ..Default::default()
        };

        let container_config = ContainerCreateBody {
            image: Some(image.clone()),
            cmd: Some(self.idle_command.clone()),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: Some(config.name.clone()),
            platform: String::new(),
        };

        match self
            .docker
            .create_container(Some(create_options), container_config)
            .await
        {
            Ok(_) => {}
            Err(e) if is_status(&e, 409) => {
                // Name already taken: reuse it only if it is running.
                return match self.running(&config.name).await? {
                    Some(true) => {
                        debug!(container = %config.name, "Container already running");
                        Ok(Self::handle_for(&config.name))
                    }
                    _ => Err(anyhow::anyhow!(
                        "container {} exists but is not running",
                        config.name
                    )),
                };
            }
            Err(e) => return Err(e).context("Failed to create container"),
        }

        if let Err(e) = self
            .docker
            .start_container(&config.name, None::<StartContainerOptions>)
            .await
        {
            let _ = self.stop(&Self::handle_for(&config.name)).await;
            return Err(e).context("Failed to start container");
        }

        info!(
            container = %config.name,
            image = %image,
            mount = %config.mount_source.display(),
            "Container started"
        );

        Ok(Self::handle_for(&config.name))
    }

    async fn transfer(&self, handle: &ProcessHandle, local: &Path, remote: &str) -> Result<()> {
        let remote = Path::new(remote);
        let (Some(parent), Some(file_name)) = (remote.parent(), remote.file_name()) else {
            anyhow::bail!("invalid remote path {}", remote.display());
        };

        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;
        let archive = single_file_tar(&file_name.to_string_lossy(), &data)?;

        self.docker
            .upload_to_container(
                &handle.id,
                Some(UploadToContainerOptions {
                    path: parent.to_string_lossy().into_owned(),
                    ..Default::default()
                }),
                body_full(Bytes::from(archive)),
            )
            .await
            .with_context(|| format!("Failed to upload payload to {}", handle.id))?;
        Ok(())
    }

    async fn exec(
        &self,
        handle: &ProcessHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        match tokio::time::timeout(timeout, self.run_exec(&handle.id, command)).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                // An exec cannot be cancelled individually; the container
                // goes down with it.
                warn!(container = %handle.id, "Exec timed out, killing container");
                self.kill(&handle.id).await;
                Err(ExecError::TimedOut(timeout))
            }
        }
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.kill(&handle.id).await;
        match self
            .docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e).context("Failed to remove container"),
        }
    }

    async fn alive(&self, handle: &ProcessHandle) -> Result<bool> {
        Ok(self.running(&handle.id).await?.unwrap_or(false))
    }

    async fn list_containers(&self) -> Result<Vec<ProcessHandle>> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .and_then(|names| names.first().cloned())
                    .map(|name| Self::handle_for(name.trim_start_matches('/')))
            })
            .collect())
    }
}
