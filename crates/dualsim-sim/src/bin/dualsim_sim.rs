//! dualsim scenario driver
//!
//! - `run`  executes TOML scenario scripts and checks their expectations
//! - `walk` replays seeded random event walks on a mock clock
//! - `soak` feeds random events to the threaded control plane until Ctrl-C,
//!   optionally serving `/metrics`

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use dualsim_core::config::DaemonConfig;
use dualsim_core::services::{self, Services};
use dualsim_sim::scenario::ScenarioScript;
use dualsim_sim::soak::{Soak, SoakConfig};
use dualsim_sim::walk::{self, WalkConfig};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Drive the dualsim control plane with scripted or random device events.
#[derive(Parser, Debug)]
#[command(name = "dualsim-sim", about = "dualsim scenario driver")]
struct Cli {
    /// Daemon config TOML for `walk` and `soak`. Scripts carry their own.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print reports as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scenario scripts.
    Run {
        #[arg(required = true)]
        scripts: Vec<PathBuf>,
    },
    /// Seeded random walks on a mock clock.
    Walk {
        /// First seed.
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Number of consecutive seeds to walk.
        #[arg(long, default_value_t = 1)]
        seeds: u64,
        #[arg(long, default_value_t = 1_000)]
        steps: usize,
        #[arg(long, default_value_t = 2)]
        slots: usize,
    },
    /// Random events against the live control plane.
    Soak {
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Pause between events in milliseconds.
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Serve Prometheus metrics on this address.
        #[arg(long)]
        metrics_addr: Option<SocketAddr>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { scripts } => run_scripts(&scripts, cli.json),
        Command::Walk {
            seed,
            seeds,
            steps,
            slots,
        } => {
            let mut base = WalkConfig {
                seed,
                steps,
                slots,
                ..WalkConfig::default()
            };
            if let Some(daemon) = config {
                base.daemon = daemon;
            }
            for report in walk::sweep(seed, seeds, &base)? {
                emit(&report, cli.json)?;
            }
            Ok(())
        }
        Command::Soak {
            seed,
            interval_ms,
            duration_secs,
            metrics_addr,
        } => {
            let mut daemon = config.unwrap_or_default();
            if metrics_addr.is_some() {
                daemon.telemetry.metrics_addr = metrics_addr;
            }
            run_soak(
                SoakConfig {
                    seed,
                    interval: Duration::from_millis(interval_ms),
                    duration: duration_secs.map(Duration::from_secs),
                    daemon,
                    ..SoakConfig::default()
                },
                cli.json,
            )
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Option<DaemonConfig>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    let config = DaemonConfig::from_toml_str(&text)
        .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?;
    Ok(Some(config))
}

fn run_scripts(paths: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for path in paths {
        let outcome = ScenarioScript::load(path).and_then(|script| script.run());
        match outcome {
            Ok(report) => emit(&report, json)?,
            Err(e) => {
                failed += 1;
                error!(script = %path.display(), error = %format!("{e:#}"), "scenario failed");
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} of {} scenarios failed", failed, paths.len());
    }
    Ok(())
}

fn run_soak(cfg: SoakConfig, json: bool) -> anyhow::Result<()> {
    let mut soak = Soak::start(cfg)?;
    services::install(Services::from_plane(soak.plane()))?;
    if let Some(addr) = soak.plane().metrics_addr() {
        info!(%addr, "metrics available at http://{}/metrics", addr);
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("shutting down...");
            if let Some(services) = services::get()
                && let Ok(snap) = services.arbiter.snapshot()
            {
                info!(
                    preferred = ?snap.state.preferred_slot,
                    sub = ?snap.state.preferred_sub,
                    "preferred data at shutdown"
                );
            }
            running.store(false, Ordering::Relaxed);
        })
        .map_err(|e| anyhow::anyhow!("Failed to install Ctrl-C handler: {}", e))?;
    }

    let report = soak.run(&running);
    soak.shutdown();
    let report = report?;
    emit(&report, json)?;
    if report.violations > 0 {
        anyhow::bail!("{} invariant violations", report.violations);
    }
    Ok(())
}

fn emit<T: Serialize + std::fmt::Debug>(report: &T, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
    } else {
        info!(?report, "report");
    }
    Ok(())
}
