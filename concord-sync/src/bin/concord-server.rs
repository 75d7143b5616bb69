//! `concord-server`: runs a sync engine behind the WebSocket server.
//!
//! ```text
//! concord-server --config concord.toml
//! concord-server --bind 0.0.0.0:9090 --data /var/lib/concord
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use concord_sync::{CleanupWorker, EngineConfig, SyncEngine, SyncServer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file. Defaults are used when omitted.
    #[arg(short, long, value_name = "FILE", env = "CONCORD_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind_addr`.
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,

    /// RocksDB directory, overriding `storage.path`.
    #[arg(short, long, value_name = "DIR", env = "CONCORD_DATA")]
    data: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(data) = cli.data {
        config.storage.path = Some(data);
    }
    config.validate()?;

    let cleanup_interval = config.retention.cleanup_interval();
    let engine = Arc::new(SyncEngine::open(config)?);
    let cleanup = CleanupWorker::new(engine.clone()).spawn(cleanup_interval);
    let server = SyncServer::new(engine.clone());

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        served = server.run() => served.map_err(Into::into),
        signal = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
            signal.map_err(Into::into)
        }
    };

    cleanup.shutdown().await;
    let stats = engine.stats().await;
    log::info!(
        "Committed {} of {} submitted operations ({} conflicts)",
        stats.committed,
        stats.submitted,
        stats.conflicts
    );
    result
}
