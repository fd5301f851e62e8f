use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, instrument};
use warmrun::{config::WarmrunConfig, metrics, otel_tracing::setup_tracing, service::Service};

#[derive(Parser)]
#[command(name = "warmrun")]
#[command(version, about = "Warm container function runner", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => WarmrunConfig::from_path(
            path.to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?,
        )?,
        None => WarmrunConfig::from_env().context("Failed to load default config")?,
    };

    let instance_id = uuid::Uuid::new_v4().to_string();
    setup_tracing(&config, &instance_id)?;
    metrics::init_provider(&config.telemetry, &instance_id)?;

    start_warmrun(config, instance_id).await
}

#[instrument(skip(config), fields(env = config.env))]
async fn start_warmrun(config: WarmrunConfig, instance_id: String) -> anyhow::Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        functions_dir = %config.functions_dir.display(),
        driver = config.driver.name(),
        "Starting warmrun"
    );

    let service = Service::new(config)
        .await
        .context("Failed to create service")?;

    service.run().await
}
