use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;

use crate::function::Language;

const LOCAL_ENV: &str = "local";
const ENV_PREFIX: &str = "WARMRUN_";
const DEFAULT_METRICS_INTERVAL_SECS: u64 = 5;
const DEFAULT_IDLE_TTL_SECS: u64 = 300;
const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;
const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingExporter {
    Stdout,
    Otlp,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum DriverConfig {
    ForkExec {
        /// Directory holding one scratch directory per instance.
        /// Defaults to `{scratch_dir}/instances`.
        #[serde(default)]
        instances_dir: Option<PathBuf>,
    },
    Docker {
        /// Docker daemon address. Supports:
        /// - Unix socket: `unix:///var/run/docker.sock` or
        ///   `/var/run/docker.sock`
        /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
        ///
        /// If not specified, uses Docker's default socket location.
        #[serde(default)]
        address: Option<String>,
        /// Docker network mode for function containers.
        #[serde(default)]
        network: Option<String>,
        /// Command keeping an idle container alive between invocations.
        #[serde(default = "default_idle_command")]
        idle_command: Vec<String>,
    },
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::ForkExec {
            instances_dir: None,
        }
    }
}

impl DriverConfig {
    pub fn name(&self) -> &'static str {
        match self {
            DriverConfig::ForkExec { .. } => "fork_exec",
            DriverConfig::Docker { .. } => "docker",
        }
    }
}

fn default_idle_command() -> Vec<String> {
    vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
}

/// Pool tuning.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Instances idle longer than this are stopped by the reaper.
    #[serde_inline_default(Duration::from_secs(DEFAULT_IDLE_TTL_SECS))]
    #[serde(with = "duration_serde")]
    pub idle_ttl: Duration,
    /// Period of the background reap sweep.
    #[serde_inline_default(Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS))]
    #[serde(with = "duration_serde")]
    pub reap_interval: Duration,
    /// Probe a warm instance with the driver before handing it out.
    #[serde_inline_default(true)]
    pub verify_on_acquire: bool,
    /// Upper bound on how long a freshly started instance may take to
    /// report live. Also capped by the invocation deadline.
    #[serde_inline_default(Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS))]
    #[serde(with = "duration_serde")]
    pub ready_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl: Duration::from_secs(DEFAULT_IDLE_TTL_SECS),
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            verify_on_acquire: true,
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
        }
    }
}

/// How instances of one language are started and triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Container image. Required by the Docker driver, ignored by fork/exec.
    #[serde(default)]
    pub image: Option<String>,
    /// Command that runs the entrypoint. The entrypoint arguments
    /// (`--language`, `--input`, `--function-dir`) are appended.
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub cpu_millicores: Option<u64>,
}

fn default_entrypoint() -> Vec<String> {
    vec!["warmrun-entrypoint".to_string()]
}

impl RuntimeConfig {
    fn with_image(image: &str) -> Self {
        Self {
            image: Some(image.to_string()),
            entrypoint: default_entrypoint(),
            memory_bytes: None,
            cpu_millicores: None,
        }
    }
}

fn default_python_runtime() -> RuntimeConfig {
    RuntimeConfig::with_image("warmrun/python:latest")
}

fn default_javascript_runtime() -> RuntimeConfig {
    RuntimeConfig::with_image("warmrun/node:latest")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimesConfig {
    #[serde(default = "default_python_runtime")]
    pub python: RuntimeConfig,
    #[serde(default = "default_javascript_runtime")]
    pub javascript: RuntimeConfig,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            python: default_python_runtime(),
            javascript: default_javascript_runtime(),
        }
    }
}

impl RuntimesConfig {
    pub fn get(&self, language: Language) -> &RuntimeConfig {
        match language {
            Language::Python => &self.python,
            Language::Javascript => &self.javascript,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enable_metrics: bool,
    /// OpenTelemetry collector grpc endpoint for traces and metrics.
    /// Defaults to using OTEL_EXPORTER_OTLP_ENDPOINT env var or to
    /// localhost:4317 if empty.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Defines the exporter to use for tracing.
    /// If not specified, we won't export traces anywhere.
    #[serde(default)]
    pub tracing_exporter: Option<TracingExporter>,
    /// Metrics export interval in seconds.
    #[serde_inline_default(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS))]
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enable_metrics: false,
            endpoint: None,
            tracing_exporter: None,
            metrics_interval: Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS),
        }
    }
}

mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(seconds))
    }
}

/// Configuration for the warmrun service.
#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmrunConfig {
    /// Environment name (e.g., "local", "staging", "production").
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    /// Address of the HTTP API.
    #[serde_inline_default("0.0.0.0:8080".to_string())]
    pub listen_addr: String,
    /// Root of the function code tree, laid out as
    /// `{functions_dir}/{language}/{function_id}/`.
    #[serde_inline_default(PathBuf::from("./functions"))]
    pub functions_dir: PathBuf,
    /// Host directory for serialized invocation payloads.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// JSON file persisting function metadata. In-memory when unset.
    #[serde(default)]
    pub metadata_path: Option<PathBuf>,
    /// Process driver configuration.
    #[serde(default)]
    pub driver: DriverConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub runtimes: RuntimesConfig,
    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("warmrun")
}

impl Default for WarmrunConfig {
    fn default() -> Self {
        WarmrunConfig {
            env: LOCAL_ENV.to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            functions_dir: PathBuf::from("./functions"),
            scratch_dir: default_scratch_dir(),
            metadata_path: None,
            driver: DriverConfig::default(),
            pool: PoolConfig::default(),
            runtimes: RuntimesConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl WarmrunConfig {
    /// Load from a YAML file overlaid with `WARMRUN_`-prefixed environment
    /// variables. Nested keys use `__`, e.g. `WARMRUN_POOL__IDLE_TTL=60`.
    pub fn from_path(path: &str) -> Result<WarmrunConfig> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        let mut config: WarmrunConfig = Figment::new()
            .merge(Yaml::string(&config_str))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the environment, used when no file is given.
    pub fn from_env() -> Result<WarmrunConfig> {
        let mut config: WarmrunConfig = Figment::new()
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<WarmrunConfig> {
        let mut config: WarmrunConfig = Figment::new()
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(anyhow::anyhow!(
                "invalid listen address: {}",
                self.listen_addr
            ));
        }
        if self.pool.idle_ttl.is_zero() {
            return Err(anyhow::anyhow!("pool.idle_ttl must be greater than 0"));
        }
        if self.pool.reap_interval.is_zero() {
            return Err(anyhow::anyhow!("pool.reap_interval must be greater than 0"));
        }
        if self.pool.ready_timeout.is_zero() {
            return Err(anyhow::anyhow!("pool.ready_timeout must be greater than 0"));
        }
        for language in Language::ALL {
            let runtime = self.runtimes.get(language);
            if runtime.entrypoint.is_empty() {
                return Err(anyhow::anyhow!(
                    "runtimes.{}.entrypoint must not be empty",
                    language
                ));
            }
            if matches!(self.driver, DriverConfig::Docker { .. }) && runtime.image.is_none() {
                return Err(anyhow::anyhow!(
                    "runtimes.{}.image is required by the docker driver",
                    language
                ));
            }
        }
        if let DriverConfig::Docker { idle_command, .. } = &self.driver &&
            idle_command.is_empty()
        {
            return Err(anyhow::anyhow!("driver.idle_command must not be empty"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }

    /// Scratch directories of fork/exec instances.
    pub fn instances_dir(&self) -> PathBuf {
        match &self.driver {
            DriverConfig::ForkExec {
                instances_dir: Some(dir),
            } => dir.clone(),
            _ => self.scratch_dir.join("instances"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let mut config = WarmrunConfig::default();
        assert_eq!(config.env, "local");
        assert!(!config.structured_logging());
        assert!(config.validate().is_ok());
        assert!(matches!(config.driver, DriverConfig::ForkExec { .. }));
        assert_eq!(config.pool.idle_ttl, Duration::from_secs(300));
        assert!(config.pool.verify_on_acquire);
        assert_eq!(
            config.runtimes.get(Language::Python).entrypoint,
            vec!["warmrun-entrypoint"]
        );
        assert_eq!(config.instances_dir(), config.scratch_dir.join("instances"));
    }

    #[test]
    fn test_docker_config() {
        let yaml = r#"
env: production
listen_addr: "127.0.0.1:9000"
functions_dir: /srv/functions
driver:
  type: docker
  network: bridge
pool:
  idle_ttl: 60
  reap_interval: 5
runtimes:
  python:
    image: "python-runtime:3.12"
    entrypoint: ["/usr/local/bin/warmrun-entrypoint"]
    memory_bytes: 268435456
"#;
        let config = WarmrunConfig::from_yaml_str(yaml).unwrap();
        assert!(config.structured_logging());
        assert_eq!(config.functions_dir, PathBuf::from("/srv/functions"));
        assert_eq!(config.pool.idle_ttl, Duration::from_secs(60));
        assert_eq!(config.pool.ready_timeout, Duration::from_secs(30));
        let DriverConfig::Docker {
            address,
            network,
            idle_command,
        } = &config.driver
        else {
            panic!("expected docker driver");
        };
        assert!(address.is_none());
        assert_eq!(network.as_deref(), Some("bridge"));
        assert_eq!(idle_command, &default_idle_command());

        let python = config.runtimes.get(Language::Python);
        assert_eq!(python.image.as_deref(), Some("python-runtime:3.12"));
        assert_eq!(python.memory_bytes, Some(268435456));
        // Untouched runtime keeps its defaults.
        assert_eq!(
            config.runtimes.get(Language::Javascript).image.as_deref(),
            Some("warmrun/node:latest")
        );
    }

    #[test]
    fn test_fork_exec_instances_dir() {
        let yaml = r#"
driver:
  type: fork_exec
  instances_dir: /var/lib/warmrun/instances
"#;
        let config = WarmrunConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.instances_dir(),
            PathBuf::from("/var/lib/warmrun/instances")
        );
    }

    #[test]
    fn test_zero_idle_ttl_rejected() {
        let yaml = r#"
pool:
  idle_ttl: 0
"#;
        let err = WarmrunConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("idle_ttl"));
    }

    #[test]
    fn test_empty_entrypoint_rejected() {
        let yaml = r#"
runtimes:
  javascript:
    entrypoint: []
"#;
        let err = WarmrunConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("runtimes.javascript.entrypoint"));
    }

    #[test]
    fn test_invalid_listen_addr_rejected() {
        let yaml = r#"
listen_addr: "not an address"
"#;
        assert!(WarmrunConfig::from_yaml_str(yaml).is_err());
    }
}
