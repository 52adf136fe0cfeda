//! eip-manager binary

use clap::Parser;
use eip_manager::{manager, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "eip-manager")]
#[command(about = "Claim a floating Elastic IP slot through Consul and bind it to this instance")]
#[command(version)]
struct Args {
    /// Consul key prefix
    #[arg(long, default_value = "nginx/eip/")]
    prefix: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("eip-manager {}", eip_manager::VERSION);
    tracing::debug!("Consul: {}", config.consul.address);

    if let Err(e) = manager::run(&config, &args.prefix).await {
        tracing::error!("Fatal: {}", e);
        return Err(e.into());
    }

    Ok(())
}
