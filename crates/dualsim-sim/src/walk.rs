//! Seeded random event walks.
//!
//! Given a seed, [`Walk`] drives a [`SimDevice`] with a reproducible stream
//! of [`DeviceEvent`]s and checks the invariants after every step. A failing
//! walk names its seed and step, so it can be replayed exactly.

use std::collections::BTreeMap;
use std::time::Duration;

use crossbeam_channel::{Receiver, TryRecvError};
use dualsim_common::models::ValidationOutcome;
use dualsim_common::protocol::RecoveryNotice;
use dualsim_common::recovery::RecoveryAction;
use dualsim_core::config::{DaemonConfig, RecoveryConfig};
use serde::Serialize;
use tracing::{debug, info};

use crate::device::{DeviceSetup, SimDevice};
use crate::events::{self, DeviceEvent, EventSource};

#[derive(Debug, Clone)]
pub struct WalkConfig {
    pub seed: u64,
    pub steps: usize,
    pub slots: usize,
    /// Subscription ids `1..=sub_pool` circulate through the slots.
    pub sub_pool: i32,
    /// Longest single clock advance.
    pub max_advance: Duration,
    pub daemon: DaemonConfig,
}

impl Default for WalkConfig {
    fn default() -> Self {
        let mut daemon = DaemonConfig::default();
        daemon.auto_switch.stability_threshold = Some(Duration::from_secs(2));
        daemon.recovery = RecoveryConfig::uniform(Duration::from_secs(10));
        Self {
            seed: 1,
            steps: 1_000,
            slots: 2,
            sub_pool: 4,
            max_advance: Duration::from_secs(15),
            daemon,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalkReport {
    pub seed: u64,
    pub steps: usize,
    pub elapsed_ms: u64,
    pub preferred_changes: u64,
    pub auto_switches: u64,
    pub overrides_accepted: u64,
    pub overrides_rejected: u64,
    pub stall_episodes: u64,
    pub recoveries: u64,
    pub actions: BTreeMap<RecoveryAction, u64>,
}

pub struct Walk {
    cfg: WalkConfig,
    source: EventSource,
    sim: SimDevice,
    overrides: Vec<Receiver<bool>>,
    report: WalkReport,
}

impl Walk {
    pub fn new(cfg: WalkConfig) -> Self {
        let source = EventSource::new(cfg.seed, cfg.slots, cfg.sub_pool, cfg.max_advance);
        let setup = DeviceSetup {
            slots: cfg.slots,
            auto_switch: (1..=cfg.sub_pool).collect(),
            ..DeviceSetup::default()
        };
        let device = setup.build();
        device
            .validator
            .set_auto_outcome(Some(ValidationOutcome::Passed));
        let sim = SimDevice::start(device, cfg.daemon.clone());
        let report = WalkReport {
            seed: cfg.seed,
            ..WalkReport::default()
        };
        Self {
            cfg,
            source,
            sim,
            overrides: Vec::new(),
            report,
        }
    }

    pub fn device(&self) -> &SimDevice {
        &self.sim
    }

    /// Run the configured number of steps. Stops at the first broken
    /// invariant, naming the step and the event that broke it.
    pub fn run(&mut self) -> anyhow::Result<WalkReport> {
        info!(seed = self.cfg.seed, steps = self.cfg.steps, "starting walk");
        self.sim.check_invariants()?;
        for idx in 0..self.cfg.steps {
            let event = self.source.next_event(&self.sim.device.subscriptions);
            debug!(idx, ?event, "walk step");
            if let Some(done) = events::apply(&mut self.sim, event.clone()) {
                self.overrides.push(done);
            }
            self.sim.check_invariants().map_err(|e| {
                anyhow::anyhow!("seed {} step {} after {:?}: {}", self.cfg.seed, idx, event, e)
            })?;
            self.check_recovery_notices()?;
            self.poll_overrides();
            self.report.steps += 1;
        }

        let stats = self.sim.arbiter.stats();
        self.report.preferred_changes = stats.preferred_changes;
        self.report.auto_switches = stats.auto_switches;
        self.report.elapsed_ms = self.sim.elapsed().as_millis() as u64;
        info!(
            seed = self.cfg.seed,
            preferred_changes = self.report.preferred_changes,
            stall_episodes = self.report.stall_episodes,
            "walk finished"
        );
        Ok(self.report.clone())
    }

    /// Rungs must never run when configured to skip.
    fn check_recovery_notices(&mut self) -> anyhow::Result<()> {
        let recovery = &self.cfg.daemon.recovery;
        for notice in self.sim.recovery_log.drain(..) {
            match notice {
                RecoveryNotice::StallDetected { action, .. } => {
                    if recovery.skips(action) {
                        anyhow::bail!("seed {}: skipped rung {:?} executed", self.cfg.seed, action);
                    }
                    *self.report.actions.entry(action).or_default() += 1;
                }
                RecoveryNotice::Recovered { .. } => self.report.recoveries += 1,
                _ => {}
            }
        }
        self.report.stall_episodes = self.sim.recovery.stats().episodes;
        Ok(())
    }

    fn poll_overrides(&mut self) {
        let report = &mut self.report;
        self.overrides.retain(|done| match done.try_recv() {
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
    }
}

/// Walk `count` consecutive seeds starting at `first`.
pub fn sweep(first: u64, count: u64, base: &WalkConfig) -> anyhow::Result<Vec<WalkReport>> {
    (first..first + count)
        .map(|seed| {
            Walk::new(WalkConfig {
                seed,
                ..base.clone()
            })
            .run()
        })
        .collect()
}
