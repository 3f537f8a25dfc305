use std::collections::BTreeMap;

use crossbeam_channel::Sender;
use dualsim_common::SlotId;
use dualsim_common::models::{PreferredDataState, RadioPowerState};
use dualsim_common::protocol::RecoveryNotice;
use dualsim_common::recovery::{RecoveredReason, RecoveryAction};
use serde::Serialize;

pub enum RecoveryEvent {
    /// Validation verdict for the connected Internet network.
    ValidationStatus { valid: bool },
    InternetNetworkChanged { connected: bool },
    PreferredDataChanged(PreferredDataState),
    RadioPowerChanged(RadioPowerState),
    AirplaneModeChanged(bool),
    MobileDataEnabledChanged(bool),
    Subscribe {
        notices: Sender<RecoveryNotice>,
        current: Sender<RecoverySnapshot>,
    },
    Snapshot(Sender<RecoverySnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTimer {
    NetworkCheck,
}

/// Why a stall signal did not run a rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Invalid network, but no recovery was ever started for it.
    NotStalled,
    AllStepsAttempted,
    BackOff,
    NoPreferredSlot,
    VoiceCall,
    PoorSignal,
    NotConnected,
    DataNotAllowed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotStalled => "not_stalled",
            SkipReason::AllStepsAttempted => "all_steps_attempted",
            SkipReason::BackOff => "back_off",
            SkipReason::NoPreferredSlot => "no_preferred_slot",
            SkipReason::VoiceCall => "voice_call",
            SkipReason::PoorSignal => "poor_signal",
            SkipReason::NotConnected => "not_connected",
            SkipReason::DataNotAllowed => "data_not_allowed",
        }
    }

    /// Whether the condition can clear on its own while the stall lasts.
    pub fn is_transient(self) -> bool {
        !matches!(self, SkipReason::NotStalled | SkipReason::AllStepsAttempted)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    pub episodes: u64,
    pub actions_executed: BTreeMap<RecoveryAction, u64>,
    pub recovered_by_dsrm: u64,
    pub recovered_by_modem: u64,
    pub recovered_by_user: u64,
    pub suppressed: u64,
    pub exhausted: u64,
}

impl RecoveryStats {
    pub fn record_action(&mut self, action: RecoveryAction) {
        *self.actions_executed.entry(action).or_default() += 1;
    }

    pub fn record_recovery(&mut self, reason: RecoveredReason) {
        match reason {
            RecoveredReason::Dsrm => self.recovered_by_dsrm += 1,
            RecoveredReason::Modem => self.recovered_by_modem += 1,
            RecoveredReason::User => self.recovered_by_user += 1,
            RecoveredReason::None => {}
        }
    }

    pub fn actions(&self, action: RecoveryAction) -> u64 {
        self.actions_executed.get(&action).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoverySnapshot {
    pub slot: Option<SlotId>,
    pub valid_network: bool,
    pub recovery_triggered: bool,
    pub current_action: RecoveryAction,
    pub last_action: RecoveryAction,
    pub attempted_all_steps: bool,
    pub stall_duration_ms: Option<u64>,
    pub stats: RecoveryStats,
}
