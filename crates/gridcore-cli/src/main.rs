//! gridcore - distributed compute worker
//!
//! Attaches to a command center, downloads simulation streams, and keeps
//! uploading verified frames and checkpoints until told to stop.

use clap::Parser;
use gridcore_core::config::{DEFAULT_CC_ADDRESS, DEFAULT_CHECKPOINT_SECS, WorkerConfig};
use gridcore_core::engine::{Platform, enumerate_devices};
use gridcore_core::transport::ProxyConfig;
use gridcore_core::{ExitSignal, Supervisor, lifecycle};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod banner;

/// gridcore - distributed compute worker
#[derive(Parser, Debug)]
#[command(name = "gridcore")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Command center address, host[:port]
    #[arg(long, default_value = DEFAULT_CC_ADDRESS)]
    cc: String,

    /// Checkpoint interval in seconds
    #[arg(long, default_value_t = DEFAULT_CHECKPOINT_SECS)]
    checkpoint: u64,

    /// Fully qualified 36 character target id
    #[arg(long = "target_id", alias = "target")]
    target_id: Option<String>,

    /// Donor access token (36 characters)
    #[arg(long = "donor_token", alias = "token")]
    donor_token: Option<String>,

    /// Proxy string, [user:pass@]host:port
    #[arg(long)]
    proxy: Option<String>,

    /// Seconds the worker should run before exiting
    #[arg(long)]
    duration: Option<u64>,

    /// Compute platform (cpu, cuda, opencl)
    #[arg(long, default_value = "cpu")]
    platform: String,

    /// Device index within the platform
    #[arg(long = "deviceId")]
    device_id: Option<u32>,

    /// Platform index (OpenCL)
    #[arg(long = "platformId")]
    platform_id: Option<u32>,

    /// List available compute devices and exit
    #[arg(long)]
    devices: bool,

    /// Hide the startup banner
    #[arg(long)]
    nospoiler: bool,

    /// PID of a parent process whose death stops the worker
    #[arg(long)]
    lifeline: Option<i32>,

    /// Authorization key presented to the command center
    #[arg(long, env = "GRIDCORE_CORE_KEY", default_value = "")]
    core_key: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Work-unit directory for host-managed progress reporting
    #[cfg(feature = "managed-host")]
    #[arg(long = "dir")]
    wu_dir: Option<std::path::PathBuf>,
}

fn build_config(cli: &Cli) -> anyhow::Result<WorkerConfig> {
    if let Some(target_id) = &cli.target_id {
        anyhow::ensure!(
            target_id.len() == 36,
            "target_id must be 36 characters, got {}",
            target_id.len()
        );
    }
    if let Some(donor_token) = &cli.donor_token {
        anyhow::ensure!(
            donor_token.len() == 36,
            "donor_token must be 36 characters, got {}",
            donor_token.len()
        );
    }
    let platform = Platform::parse(&cli.platform)
        .map_err(|name| anyhow::anyhow!("unknown platform '{name}'"))?;
    let proxy = cli
        .proxy
        .as_deref()
        .map(ProxyConfig::parse)
        .transpose()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(WorkerConfig {
        cc_address: cli.cc.clone(),
        core_key: cli.core_key.clone(),
        donor_token: cli.donor_token.clone(),
        target_id: cli.target_id.clone(),
        proxy,
        checkpoint_interval_secs: cli.checkpoint,
        platform,
        device_index: cli.device_id,
        platform_index: cli.platform_id,
        #[cfg(feature = "managed-host")]
        wu_dir: cli.wu_dir.clone(),
        ..WorkerConfig::default()
    })
}

fn list_devices() {
    for device in enumerate_devices() {
        println!("{} {}: {}", device.platform, device.index, device.description);
    }
}

fn main() {
    // The distinguished core-outdated code (0x110) does not fit in the
    // ExitCode byte surface, so exit codes go through process::exit.
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if cli.devices {
        list_devices();
        return 1;
    }
    if !cli.nospoiler {
        banner::print_banner();
    }

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return 1;
        },
    };

    if let Err(err) = lifecycle::init() {
        error!(error = %err, "could not install signal handlers");
        return 1;
    }
    if let Some(pid) = cli.lifeline {
        lifecycle::set_lifeline(pid);
    }
    if let Some(seconds) = cli.duration {
        lifecycle::set_duration_limit(seconds);
    }

    let supervisor = Supervisor::new(config, ExitSignal::global());
    match supervisor.run() {
        Ok(()) => {
            info!("worker finished");
            0
        },
        Err(err) => {
            error!(error = %err, "worker terminated");
            err.exit_code()
        },
    }
}
