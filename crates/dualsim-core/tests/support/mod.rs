//! Single-threaded device bench: both control loops on one mock clock,
//! wired the way the control plane wires them.

#![allow(dead_code)]

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
use quanta::Clock;

pub struct Bench {
    pub device: MemoryDevice,
    pub arbiter: PreferredDataArbiter,
    pub recovery: DataStallRecoveryManager,
    pub mock: Arc<quanta::Mock>,
    pub arbiter_log: Vec<ArbiterNotice>,
    pub recovery_log: Vec<RecoveryNotice>,
    mailbox: Receiver<ArbiterEvent>,
    arbiter_notices: Receiver<ArbiterNotice>,
    recovery_notices: Receiver<RecoveryNotice>,
}

/// Two SIMs, sub 1 in slot 0 as primary, sub 2 in slot 1, both home.
pub fn two_sims() -> MemoryDevice {
    let device = MemoryDevice::new(2);
    device.subscriptions.insert_sim(SlotId(0), SubId(1));
    device.subscriptions.insert_sim(SlotId(1), SubId(2));
    device.subscriptions.set_default_data(Some(SubId(1)));
    device
        .subscriptions
        .set_registration(SlotId(0), RegistrationState::Home);
    device
        .subscriptions
        .set_registration(SlotId(1), RegistrationState::Home);
    device
}

/// Route loop logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Bench {
    pub fn start(device: MemoryDevice, config: DaemonConfig) -> Self {
        init_tracing();
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
        let (stx, _srx) = unbounded();
        recovery.handle(RecoveryEvent::Subscribe {
            notices: rtx,
            current: stx,
        });
        recovery.handle(RecoveryEvent::InternetNetworkChanged { connected: true });

        let mut bench = Self {
            device,
            arbiter,
            recovery,
            mock,
            arbiter_log: Vec::new(),
            recovery_log: Vec::new(),
            mailbox,
            arbiter_notices,
            recovery_notices,
        };
        bench.pump();
        bench
    }

    /// Run both mailboxes until nothing is left to deliver.
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

    pub fn advance(&mut self, d: Duration) {
        self.mock.increment(d);
        self.arbiter.fire_due_timers();
        self.recovery.fire_due_timers();
        self.pump();
    }

    pub fn set_registration(&mut self, slot: usize, reg: RegistrationState) {
        self.device
            .subscriptions
            .set_registration(SlotId(slot), reg);
        self.arbiter_event(ArbiterEvent::ServiceStateChanged(SlotId(slot)));
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
}
