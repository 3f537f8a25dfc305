//! Soak driver: the threaded control plane on the real clock, fed random
//! device events until told to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use dualsim_common::models::ValidationOutcome;
use dualsim_core::ControlPlane;
use dualsim_core::arbiter::ArbiterEvent;
use dualsim_core::collab::memory::MemoryDevice;
use dualsim_core::config::DaemonConfig;
use dualsim_core::recovery::RecoveryEvent;
use dualsim_core::runtime::{ArbiterHandle, RecoveryHandle};
use quanta::Clock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::device::DeviceSetup;
use crate::events::{self, EventSink, EventSource};
use crate::invariants;

#[derive(Debug, Clone)]
pub struct SoakConfig {
    pub seed: u64,
    /// Pause between events; also the longest a drawn clock advance sleeps.
    pub interval: Duration,
    /// Run until stopped when unset.
    pub duration: Option<Duration>,
    pub sub_pool: i32,
    pub setup: DeviceSetup,
    pub daemon: DaemonConfig,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            interval: Duration::from_millis(50),
            duration: None,
            sub_pool: 4,
            setup: DeviceSetup::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SoakReport {
    pub seed: u64,
    pub steps: u64,
    pub violations: u64,
    pub overrides_accepted: u64,
    pub overrides_rejected: u64,
    pub elapsed_ms: u64,
    pub preferred_changes: u64,
    pub stall_episodes: u64,
}

pub struct Soak {
    cfg: SoakConfig,
    plane: ControlPlane,
    device: MemoryDevice,
    source: EventSource,
}

/// Events go over the mailboxes; a clock advance is a real sleep.
struct LiveSink<'a> {
    device: &'a MemoryDevice,
    arbiter: ArbiterHandle,
    recovery: RecoveryHandle,
    max_sleep: Duration,
}

impl EventSink for LiveSink<'_> {
    fn device(&self) -> &MemoryDevice {
        self.device
    }

    fn arbiter(&mut self, event: ArbiterEvent) {
        if let Err(e) = self.arbiter.send(event) {
            warn!(error = %e, "arbiter event dropped");
        }
    }

    fn recovery(&mut self, event: RecoveryEvent) {
        if let Err(e) = self.recovery.send(event) {
            warn!(error = %e, "recovery event dropped");
        }
    }

    fn advance(&mut self, d: Duration) {
        thread::sleep(d.min(self.max_sleep));
    }
}

impl Soak {
    pub fn start(cfg: SoakConfig) -> anyhow::Result<Self> {
        let device = cfg.setup.build();
        device
            .validator
            .set_auto_outcome(Some(ValidationOutcome::Passed));
        let plane = ControlPlane::start(&cfg.daemon, device.collaborators(), Clock::new())?;
        let reporter = plane.radio_power();
        device.radio.on_power_cycle(move |slot| {
            if let Err(e) = reporter.power_cycled() {
                warn!(%slot, error = %e, "power cycle not reported");
            }
        });
        let source = EventSource::new(
            cfg.seed,
            cfg.setup.slots,
            cfg.sub_pool,
            cfg.interval,
        );
        Ok(Self {
            cfg,
            plane,
            device,
            source,
        })
    }

    pub fn plane(&self) -> &ControlPlane {
        &self.plane
    }

    /// Feed events until `running` clears or the configured duration passes.
    /// Invariant violations are logged and counted, not fatal.
    pub fn run(&mut self, running: &AtomicBool) -> anyhow::Result<SoakReport> {
        let started = Instant::now();
        let arbiter = self.plane.arbiter();
        let recovery = self.plane.recovery();
        let mut sink = LiveSink {
            device: &self.device,
            arbiter: arbiter.clone(),
            recovery: recovery.clone(),
            max_sleep: self.cfg.interval,
        };
        let mut report = SoakReport {
            seed: self.cfg.seed,
            ..SoakReport::default()
        };
        let mut overrides = Vec::new();
        info!(seed = self.cfg.seed, interval = ?self.cfg.interval, "soak started");

        while running.load(Ordering::Relaxed) {
            if self.cfg.duration.is_some_and(|d| started.elapsed() >= d) {
                break;
            }
            let event = self.source.next_event(&self.device.subscriptions);
            if let Some(done) = events::apply(&mut sink, event.clone()) {
                overrides.push(done);
            }
            overrides.retain(|done: &Receiver<bool>| match done.try_recv() {
                Ok(true) => {
                    report.overrides_accepted += 1;
                    false
                }
                Ok(false) => {
                    report.overrides_rejected += 1;
                    false
                }
                Err(TryRecvError::Empty) => true,
                Err(TryRecvError::Disconnected) => false,
            });

            // The snapshot queues behind the event, so it sees its effect.
            let snap = arbiter.snapshot()?;
            if let Err(e) = invariants::check_arbiter(
                &snap,
                &self.device.subscriptions,
                self.cfg.daemon.arbiter.max_data_attach,
            ) {
                report.violations += 1;
                error!(step = report.steps, ?event, error = %e, "invariant violated");
            }
            report.steps += 1;
            report.preferred_changes = snap.stats.preferred_changes;
            thread::sleep(self.cfg.interval);
        }

        report.stall_episodes = recovery.snapshot()?.stats.episodes;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            steps = report.steps,
            violations = report.violations,
            preferred_changes = report.preferred_changes,
            "soak finished"
        );
        Ok(report)
    }

    pub fn shutdown(mut self) {
        self.plane.shutdown();
    }
}
