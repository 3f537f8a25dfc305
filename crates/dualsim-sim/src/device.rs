//! A whole device on one thread.
//!
//! Both control loops run against the in-memory collaborators and share a
//! mock clock. Mailboxes and notice channels are drained by [`SimDevice::pump`]
//! in the same order the control plane threads would deliver them, so a
//! script or a walk sees exactly one interleaving per input sequence.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};
use dualsim_common::models::{PreferredDataState, RegistrationState};
use dualsim_common::protocol::{ArbiterNotice, RecoveryNotice};
use dualsim_common::recovery::RecoveryAction;
use dualsim_common::{SlotId, SubId};
use dualsim_core::arbiter::{ArbiterEvent, PreferredDataArbiter};
use dualsim_core::collab::memory::MemoryDevice;
use dualsim_core::config::DaemonConfig;
use dualsim_core::recovery::{DataStallRecoveryManager, RecoveryEvent};
use quanta::{Clock, Mock};
use serde::Deserialize;

use crate::invariants;

/// Initial SIM layout. Missing fields take the values of the two-SIM default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceSetup {
    pub slots: usize,
    /// Default data subscription.
    pub primary: Option<i32>,
    pub sims: Vec<SimSetup>,
    /// Subscriptions allowed to take over data when the primary loses service.
    pub auto_switch: Vec<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimSetup {
    pub slot: usize,
    pub sub: i32,
    #[serde(default = "home")]
    pub registration: RegistrationState,
}

fn home() -> RegistrationState {
    RegistrationState::Home
}

impl Default for DeviceSetup {
    /// Two SIMs, sub 1 in slot 0 as primary and sub 2 in slot 1, both home.
    fn default() -> Self {
        Self {
            slots: 2,
            primary: Some(1),
            sims: vec![
                SimSetup {
                    slot: 0,
                    sub: 1,
                    registration: RegistrationState::Home,
                },
                SimSetup {
                    slot: 1,
                    sub: 2,
                    registration: RegistrationState::Home,
                },
            ],
            auto_switch: Vec::new(),
        }
    }
}

impl DeviceSetup {
    pub fn build(&self) -> MemoryDevice {
        use dualsim_core::collab::{SettingKey, SettingsStore};

        let device = MemoryDevice::new(self.slots);
        for sim in &self.sims {
            device
                .subscriptions
                .insert_sim(SlotId(sim.slot), SubId(sim.sub));
            device
                .subscriptions
                .set_registration(SlotId(sim.slot), sim.registration);
        }
        device
            .subscriptions
            .set_default_data(self.primary.map(SubId));
        for sub in &self.auto_switch {
            device
                .settings
                .set_bool(SettingKey::AutoDataSwitch(SubId(*sub)), true);
        }
        device
    }
}

pub struct SimDevice {
    pub device: MemoryDevice,
    pub arbiter: PreferredDataArbiter,
    pub recovery: DataStallRecoveryManager,
    pub config: DaemonConfig,
    pub arbiter_log: Vec<ArbiterNotice>,
    pub recovery_log: Vec<RecoveryNotice>,
    mock: Arc<Mock>,
    elapsed: Duration,
    mailbox: Receiver<ArbiterEvent>,
    arbiter_notices: Receiver<ArbiterNotice>,
    recovery_notices: Receiver<RecoveryNotice>,
}

impl SimDevice {
    pub fn start(device: MemoryDevice, config: DaemonConfig) -> Self {
        let (clock, mock) = Clock::mock();
        let (tx, mailbox) = unbounded();
        let mut arbiter = PreferredDataArbiter::new(
            config.arbiter.clone(),
            config.auto_switch.clone(),
            device.collaborators(),
            clock.clone(),
            tx.clone(),
        );
        arbiter.start();

        let (ntx, arbiter_notices) = unbounded();
        let (ctx, crx) = unbounded();
        arbiter.handle(ArbiterEvent::Subscribe {
            notices: ntx,
            current: ctx,
        });
        let preferred = crx.try_recv().unwrap_or_else(|_| PreferredDataState::default());

        let mut recovery = DataStallRecoveryManager::new(
            config.recovery.clone(),
            device.collaborators(),
            clock,
            tx,
            preferred,
        );
        let (rtx, recovery_notices) = unbounded();
        let (stx, _) = unbounded();
        recovery.handle(RecoveryEvent::Subscribe {
            notices: rtx,
            current: stx,
        });
        recovery.handle(RecoveryEvent::InternetNetworkChanged { connected: true });

        let mut sim = Self {
            device,
            arbiter,
            recovery,
            config,
            arbiter_log: Vec::new(),
            recovery_log: Vec::new(),
            mock,
            elapsed: Duration::ZERO,
            mailbox,
            arbiter_notices,
            recovery_notices,
        };
        sim.pump();
        sim
    }

    /// Deliver everything queued until both loops are idle.
    pub fn pump(&mut self) {
        loop {
            let mut progressed = false;
            while let Ok(event) = self.mailbox.try_recv() {
                self.arbiter.handle(event);
                progressed = true;
            }
            while let Ok(notice) = self.arbiter_notices.try_recv() {
                if let ArbiterNotice::PreferredDataChanged(state) = &notice {
                    self.recovery
                        .handle(RecoveryEvent::PreferredDataChanged(*state));
                }
                self.arbiter_log.push(notice);
                progressed = true;
            }
            while let Ok(notice) = self.recovery_notices.try_recv() {
                self.recovery_log.push(notice);
                progressed = true;
            }
            if !progressed {
                break;
            }
        }
    }

    pub fn arbiter_event(&mut self, event: ArbiterEvent) {
        self.arbiter.handle(event);
        self.pump();
    }

    pub fn recovery_event(&mut self, event: RecoveryEvent) {
        self.recovery.handle(event);
        self.pump();
    }

    pub fn validation(&mut self, valid: bool) {
        self.recovery_event(RecoveryEvent::ValidationStatus { valid });
    }

    /// Move the clock forward and fire whatever came due on either loop.
    pub fn advance(&mut self, d: Duration) {
        self.mock.increment(d);
        self.elapsed += d;
        self.arbiter.fire_due_timers();
        self.recovery.fire_due_timers();
        self.pump();
    }

    /// Time advanced since start.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn set_registration(&mut self, slot: SlotId, registration: RegistrationState) {
        self.device
            .subscriptions
            .set_registration(slot, registration);
        self.arbiter_event(ArbiterEvent::ServiceStateChanged(slot));
    }

    pub fn preferred(&self) -> Option<SlotId> {
        self.arbiter.state().preferred_slot
    }

    /// Rungs executed since the last call.
    pub fn take_actions(&mut self) -> Vec<RecoveryAction> {
        self.recovery_log
            .drain(..)
            .filter_map(|n| match n {
                RecoveryNotice::StallDetected { action, .. } => Some(action),
                _ => None,
            })
            .collect()
    }

    /// Check every cross-loop invariant against the current state.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        invariants::check_arbiter(
            &self.arbiter.snapshot(),
            &self.device.subscriptions,
            self.config.arbiter.max_data_attach,
        )?;
        let recovery_slot = self.recovery.snapshot().slot;
        if recovery_slot != self.preferred() {
            anyhow::bail!(
                "recovery watches {:?} while data is preferred on {:?}",
                recovery_slot,
                self.preferred()
            );
        }
        Ok(())
    }
}
