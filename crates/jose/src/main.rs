use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use jose_core::config::{Config, DEFAULT_CONFIG_PATH};

/// Matrix bot that asks members from unknown servers to confirm their join.
#[derive(Debug, Parser)]
#[command(name = "jose", version)]
struct Cli {
    /// Path to the YAML config file.
    #[arg(default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), jose_core::Error> {
    let cli = Cli::parse();

    let cfg = Arc::new(Config::load(&cli.config)?);
    let _log = jose_core::logging::init("jose", &cfg.logging)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    jose_matrix::router::run_sync(cfg, shutdown)
        .await
        .map_err(|e| jose_core::Error::External(format!("matrix bot failed: {e}")))?;

    info!("Bye!");
    Ok(())
}
