//! Scripted in-process driver and fixtures shared by the integration tests.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use warmrun::{
    code_store::CodeStore,
    config::{PoolConfig, RuntimesConfig},
    dispatcher::Dispatcher,
    driver::{ExecError, ExecOutput, ProcessConfig, ProcessDriver, ProcessHandle},
    function::{FunctionDescriptor, FunctionId, Language},
    metrics::WarmrunMetrics,
    pool::ContainerPool,
};

/// What the next exec does.
#[derive(Debug, Clone)]
pub enum ExecBehavior {
    /// Print the transferred payload back, like an identity handler.
    Echo,
    /// Echo after a delay.
    DelayedEcho(Duration),
    Reply {
        stdout: String,
        stderr: String,
        exit_code: i64,
    },
    /// Never finish; reports a timeout once the exec timeout elapses.
    Hang,
    /// The runtime cannot run the command at all.
    Fail(String),
}

#[derive(Debug)]
struct FakeInstance {
    alive: bool,
    input: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct FakeDriver {
    instances: Mutex<HashMap<String, FakeInstance>>,
    script: Mutex<VecDeque<ExecBehavior>>,
    started: Mutex<Vec<String>>,
    stopped: Mutex<Vec<String>>,
    payloads: Mutex<Vec<Value>>,
    commands: Mutex<Vec<Vec<String>>>,
    start_delay: Mutex<Option<Duration>>,
    probe_delay: Mutex<Option<Duration>>,
    fail_start: AtomicBool,
    fail_transfer: AtomicBool,
    running_execs: AtomicUsize,
    max_running_execs: AtomicUsize,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue behaviors for the next execs. Execs past the script echo.
    pub fn script(&self, behaviors: impl IntoIterator<Item = ExecBehavior>) {
        self.script.lock().extend(behaviors);
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_transfer(&self, fail: bool) {
        self.fail_transfer.store(fail, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = Some(delay);
    }

    /// Make every liveness probe take `delay` before answering.
    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock() = Some(delay);
    }

    /// Mark an instance as crashed without removing it.
    pub fn crash(&self, id: &str) {
        if let Some(instance) = self.instances.lock().get_mut(id) {
            instance.alive = false;
        }
    }

    /// Pretend an instance survived from an earlier run.
    pub fn add_orphan(&self, id: &str) {
        self.instances.lock().insert(
            id.to_string(),
            FakeInstance {
                alive: true,
                input: None,
            },
        );
    }

    pub fn starts(&self) -> usize {
        self.started.lock().len()
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads.lock().clone()
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    pub fn max_running_execs(&self) -> usize {
        self.max_running_execs.load(Ordering::SeqCst)
    }

    fn handle(id: &str) -> ProcessHandle {
        ProcessHandle {
            id: id.to_string(),
            input_path: "/tmp/input.json".to_string(),
            function_dir: "/function".to_string(),
        }
    }
}

struct RunningExec<'a>(&'a AtomicUsize);

impl Drop for RunningExec<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessDriver for FakeDriver {
    async fn start(&self, config: ProcessConfig) -> Result<ProcessHandle> {
        let delay = *self.start_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("image {:?} not found", config.image);
        }

        let mut instances = self.instances.lock();
        if !instances.contains_key(&config.name) {
            instances.insert(
                config.name.clone(),
                FakeInstance {
                    alive: true,
                    input: None,
                },
            );
            self.started.lock().push(config.name.clone());
        }
        Ok(Self::handle(&config.name))
    }

    async fn transfer(&self, handle: &ProcessHandle, local: &Path, _remote: &str) -> Result<()> {
        if self.fail_transfer.load(Ordering::SeqCst) {
            anyhow::bail!("copy to {} failed", handle.id);
        }
        let bytes = std::fs::read(local)?;
        self.payloads.lock().push(serde_json::from_slice(&bytes)?);

        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(&handle.id) else {
            anyhow::bail!("no such instance {}", handle.id);
        };
        instance.input = Some(bytes);
        Ok(())
    }

    async fn exec(
        &self,
        handle: &ProcessHandle,
        command: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, ExecError> {
        self.commands.lock().push(command.to_vec());
        let input = match self.instances.lock().get(&handle.id) {
            Some(instance) => instance.input.clone().unwrap_or_default(),
            None => return Err(anyhow::anyhow!("no such instance {}", handle.id).into()),
        };

        let running = self.running_execs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running_execs.fetch_max(running, Ordering::SeqCst);
        let _running = RunningExec(&self.running_execs);

        let behavior = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(ExecBehavior::Echo);
        let echo = |stdout: Vec<u8>| ExecOutput {
            stdout,
            stderr: vec![],
            exit_code: Some(0),
        };
        match behavior {
            ExecBehavior::Echo => Ok(echo(input)),
            ExecBehavior::DelayedEcho(delay) => {
                tokio::time::sleep(delay).await;
                Ok(echo(input))
            }
            ExecBehavior::Reply {
                stdout,
                stderr,
                exit_code,
            } => Ok(ExecOutput {
                stdout: stdout.into_bytes(),
                stderr: stderr.into_bytes(),
                exit_code: Some(exit_code),
            }),
            ExecBehavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(ExecError::TimedOut(timeout))
            }
            ExecBehavior::Fail(reason) => Err(anyhow::anyhow!(reason).into()),
        }
    }

    async fn stop(&self, handle: &ProcessHandle) -> Result<()> {
        self.instances.lock().remove(&handle.id);
        self.stopped.lock().push(handle.id.clone());
        Ok(())
    }

    async fn alive(&self, handle: &ProcessHandle) -> Result<bool> {
        let delay = *self.probe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .instances
            .lock()
            .get(&handle.id)
            .is_some_and(|instance| instance.alive))
    }

    async fn list_containers(&self) -> Result<Vec<ProcessHandle>> {
        Ok(self
            .instances
            .lock()
            .keys()
            .map(|id| Self::handle(id))
            .collect())
    }
}

pub fn test_pool_config() -> PoolConfig {
    PoolConfig {
        idle_ttl: Duration::from_secs(60),
        reap_interval: Duration::from_secs(30),
        verify_on_acquire: true,
        ready_timeout: Duration::from_secs(5),
    }
}

pub fn new_pool(driver: Arc<FakeDriver>, config: PoolConfig) -> ContainerPool {
    ContainerPool::new(
        driver,
        config,
        RuntimesConfig::default(),
        WarmrunMetrics::new(),
    )
}

pub fn descriptor(id: FunctionId, language: Language, timeout_secs: u64) -> FunctionDescriptor {
    FunctionDescriptor {
        id,
        name: format!("fn-{}", id),
        route: format!("/fn-{}", id),
        language,
        timeout_secs,
    }
}

/// A dispatcher over a [`FakeDriver`] with its own function and scratch
/// directories.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub driver: Arc<FakeDriver>,
    pub pool: ContainerPool,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let driver = FakeDriver::new();
        let pool = new_pool(driver.clone(), test_pool_config());
        let dispatcher = Dispatcher::new(
            CodeStore::new(dir.path().join("functions")),
            pool.clone(),
            driver.clone(),
            RuntimesConfig::default(),
            dir.path().join("scratch"),
            WarmrunMetrics::new(),
        );
        Self {
            dir,
            driver,
            pool,
            dispatcher,
        }
    }

    pub fn functions_dir(&self) -> PathBuf {
        self.dir.path().join("functions")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Write a handler for `id` and return its descriptor.
    pub fn add_function(&self, id: FunctionId, language: Language) -> FunctionDescriptor {
        let dir = self.code_dir(id, language);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(language.handler_file()), "").unwrap();
        descriptor(id, language, 2)
    }

    pub fn code_dir(&self, id: FunctionId, language: Language) -> PathBuf {
        self.functions_dir()
            .join(language.as_str())
            .join(id.to_string())
    }

    /// Files left in the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.scratch_dir()) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => vec![],
        }
    }
}
