//! Coordinator binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use spacecoord::common::{AuditEventType, AuditLogger, Config};
use spacecoord::{Coordinator, CoordinatorServer};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "spacecoord")]
#[command(about = "spacecoord cluster coordinator")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = "spacecoord.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start coordinator server
    Serve {
        /// Address both listeners bind to
        #[arg(long)]
        bind: Option<IpAddr>,

        /// Port for control connections
        #[arg(long)]
        control_port: Option<u16>,

        /// Port for instance and client connections
        #[arg(long)]
        host_port: Option<u16>,

        /// Snapshot to restore from
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Where shutdown writes its snapshot
        #[arg(long)]
        snapshot_path: Option<PathBuf>,

        /// Audit log (JSON lines)
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Seed for placement and state ids
        #[arg(long)]
        seed: Option<u64>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            control_port,
            host_port,
            state_file,
            snapshot_path,
            audit_log,
            seed,
            log_level,
        } => {
            // File and environment first, CLI flags have priority
            let mut config = Config::load_from(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            if let Some(level) = log_level {
                config.log_level = level;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let coord_config = &mut config.coordinator;
            if let Some(bind) = bind {
                coord_config.bind_addr = bind;
            }
            if let Some(port) = control_port {
                coord_config.control_port = port;
            }
            if let Some(port) = host_port {
                coord_config.host_port = port;
            }
            if state_file.is_some() {
                coord_config.state_file = state_file;
            }
            if snapshot_path.is_some() {
                coord_config.snapshot_path = snapshot_path;
            }
            if audit_log.is_some() {
                coord_config.audit_log = audit_log;
            }
            if seed.is_some() {
                coord_config.rng_seed = seed;
            }
            config.validate()?;

            let rng = match config.coordinator.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };

            let coord = match &config.coordinator.state_file {
                Some(path) => {
                    let text = tokio::fs::read_to_string(path)
                        .await
                        .with_context(|| format!("reading state file {}", path.display()))?;
                    let coord = Coordinator::restore(&text, rng)
                        .with_context(|| format!("restoring state from {}", path.display()))?;
                    if let Some(audit_path) = &config.coordinator.audit_log {
                        AuditLogger::open(audit_path).log_event(
                            AuditEventType::StateRestored,
                            "coordinator",
                            Some(path.display().to_string()),
                            coord.config_version(),
                        );
                    }
                    coord
                }
                None => Coordinator::with_rng(rng),
            };

            let server = CoordinatorServer::new(config.coordinator, coord);
            tokio::select! {
                result = server.serve() => result?,
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, stopping coordinator");
                }
            }
        }
    }

    Ok(())
}
