use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::info;

use portmem::{daemon_context, LogSink, PortManager, ShmemConfig};

#[derive(Parser)]
#[command(about = "Shared-memory port broker daemon")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "portmem-daemon.toml")]
    config: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DaemonConfig {
    shmem: ShmemConfig,
    discovery_interval_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            shmem: ShmemConfig::default(),
            discovery_interval_ms: 50,
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let opts = Opts::parse();
    let cfg: DaemonConfig = confy::load_path(&opts.config)?;
    info!(?cfg, "starting port broker");

    let ctx = daemon_context(&cfg.shmem)?;
    let sink = LogSink;
    let manager = PortManager::new(ctx.segment(), &sink);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    let interval = Duration::from_millis(cfg.discovery_interval_ms);
    while !shutdown.load(Ordering::Relaxed) {
        manager.do_discovery();
        thread::sleep(interval);
    }

    info!("shutdown requested, stopping discovery loop");
    Ok(())
}
