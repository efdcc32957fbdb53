//! rewire daemon binary
//!
//! Loads the configuration, connects the hosted clients to JACK and runs the
//! scheduler until SIGTERM or SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rewire::{
    AudioServer, JackServer, MemoryServer, PluginCatalog, RuntimeContext, Scheduler, Signals,
};
use rewireconf::RewireConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// JACK plugin host with rule-based port routing
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file, loaded after the system and user files
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port for the JSON status server
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at debug level regardless of RUST_LOG
    #[arg(long)]
    debug: bool,

    /// Lock all memory pages into RAM
    #[arg(long)]
    mlock: bool,

    /// Run against an in-process graph instead of JACK
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = RewireConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = cli.port {
        config.daemon.http_port = port;
    }

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("rewire {} starting", env!("CARGO_PKG_VERSION"));
    for file in &sources.files {
        info!("loaded config from {}", file.display());
    }
    for var in &sources.env_overrides {
        info!("config override from ${}", var);
    }
    for rejected in &sources.rejected {
        warn!("skipped config entry {}", rejected);
    }

    if cli.mlock || config.daemon.lock_memory {
        lock_memory();
    }

    let ctx = Arc::new(RuntimeContext::new(&config.daemon, cli.debug));
    let server: Box<dyn AudioServer> = if cli.dry_run {
        info!("dry run: using the in-memory audio server");
        Box::new(MemoryServer::default())
    } else {
        Box::new(JackServer)
    };
    let catalog = Arc::new(PluginCatalog::builtin());

    let mut scheduler =
        Scheduler::new(Arc::clone(&ctx), server, catalog, &config).with_config_path(cli.config);
    match Signals::install() {
        Ok(signals) => scheduler = scheduler.with_signals(signals),
        Err(e) => error!("cannot install signal handlers, stop with SIGKILL: {}", e),
    }

    scheduler.run();
    scheduler.shutdown();

    info!("rewire shutdown complete");
    Ok(())
}

fn lock_memory() {
    // SAFETY: mlockall takes no pointers
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if result == 0 {
        info!("locked memory");
    } else {
        warn!("mlockall failed: {}", std::io::Error::last_os_error());
    }
}
