use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    code_store::CodeStore,
    config::{DriverConfig, WarmrunConfig},
    dispatcher::Dispatcher,
    driver::{DockerDriver, ForkExecDriver, ProcessDriver},
    function_store::FunctionStore,
    http_server::{AppState, run_http_server},
    metrics::WarmrunMetrics,
    pool::ContainerPool,
};

pub struct Service {
    config: WarmrunConfig,
    store: Arc<FunctionStore>,
    pool: ContainerPool,
    dispatcher: Dispatcher,
}

impl Service {
    pub async fn new(config: WarmrunConfig) -> Result<Self> {
        let driver = create_process_driver(&config)?;
        Self::with_driver(config, driver).await
    }

    /// Build the service around an existing driver.
    pub async fn with_driver(config: WarmrunConfig, driver: Arc<dyn ProcessDriver>) -> Result<Self> {
        let store = Arc::new(match &config.metadata_path {
            Some(path) => FunctionStore::open(path)
                .await
                .context("Failed to open function store")?,
            None => FunctionStore::in_memory(),
        });

        tokio::fs::create_dir_all(&config.scratch_dir)
            .await
            .with_context(|| {
                format!(
                    "Failed to create scratch directory {}",
                    config.scratch_dir.display()
                )
            })?;

        let metrics = WarmrunMetrics::new();
        let pool = ContainerPool::new(
            driver.clone(),
            config.pool.clone(),
            config.runtimes.clone(),
            metrics.clone(),
        );
        let dispatcher = Dispatcher::new(
            CodeStore::new(config.functions_dir.clone()),
            pool.clone(),
            driver,
            config.runtimes.clone(),
            config.scratch_dir.clone(),
            metrics,
        );

        Ok(Self {
            config,
            store,
            pool,
            dispatcher,
        })
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Starting warmrun service");
        let span = tracing::Span::current();

        let cleaned = self.pool.cleanup_orphans().await;
        if cleaned > 0 {
            tracing::info!(cleaned, "Cleaned up orphaned instances");
        }

        let cancel_token = CancellationToken::new();
        let mut tasks = JoinSet::new();

        tasks.spawn({
            let span = span.clone();
            let pool = self.pool.clone();
            let cancel_token = cancel_token.clone();
            async move { pool.run_reaper(cancel_token).await }.instrument(span)
        });

        let state = AppState::new(self.store.clone(), self.dispatcher.clone());
        let listen_addr = self.config.listen_addr.clone();
        let server = run_http_server(&listen_addr, state, cancel_token.clone());
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => {
                cancel_token.cancel();
                if let Err(e) = result {
                    tracing::error!(error = ?e, "HTTP server stopped");
                    self.pool.shutdown().await;
                    return Err(e);
                }
            }
            signal_name = wait_for_shutdown_signal() => {
                tracing::info!(signal = signal_name, "Shutdown signal received");
                cancel_token.cancel();
                // Drain in-flight requests before stopping instances.
                if let Err(e) = server.await {
                    tracing::error!(error = ?e, "HTTP server error during shutdown");
                }
            }
        }

        while tasks.join_next().await.is_some() {}
        self.pool.shutdown().await;
        tracing::info!("Warmrun service stopped");
        Ok(())
    }
}

async fn wait_for_shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}

/// Create the process driver based on config (ForkExec or Docker).
pub fn create_process_driver(config: &WarmrunConfig) -> Result<Arc<dyn ProcessDriver>> {
    match &config.driver {
        DriverConfig::ForkExec { .. } => Ok(Arc::new(ForkExecDriver::new(config.instances_dir()))),
        DriverConfig::Docker {
            address,
            network,
            idle_command,
        } => Ok(Arc::new(DockerDriver::new(
            address.as_deref(),
            network.clone(),
            idle_command.clone(),
        )?)),
    }
}
