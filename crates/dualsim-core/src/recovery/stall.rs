//! Per-device stall bookkeeping.

use dualsim_common::recovery::{RecoveredReason, RecoveryAction};
use quanta::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallState {
    pub is_valid_network: bool,
    pub recovery_triggered: bool,
    /// Rung to run next.
    pub current_action: RecoveryAction,
    /// Rung run most recently.
    pub last_action: RecoveryAction,
    pub data_stall_start: Option<Instant>,
    pub last_recovery_at: Option<Instant>,
    pub attempted_all_steps: bool,
    pub radio_state_changed: bool,
    pub airplane_mode_toggled: bool,
    pub mobile_data_reenabled: bool,
    /// A rung ran and no validation verdict has arrived since.
    pub first_validation_pending: bool,
}

impl Default for StallState {
    fn default() -> Self {
        Self {
            is_valid_network: true,
            recovery_triggered: false,
            current_action: RecoveryAction::GetDataCallList,
            last_action: RecoveryAction::GetDataCallList,
            data_stall_start: None,
            last_recovery_at: None,
            attempted_all_steps: false,
            radio_state_changed: false,
            airplane_mode_toggled: false,
            mobile_data_reenabled: false,
            first_validation_pending: false,
        }
    }
}

impl StallState {
    pub fn recovery_started(&self) -> bool {
        self.current_action != RecoveryAction::GetDataCallList || self.recovery_triggered
    }

    /// In the middle of a stall that recovery is working on.
    pub fn in_stall(&self) -> bool {
        !self.is_valid_network && self.recovery_triggered
    }

    pub fn clear_side_signals(&mut self) {
        self.radio_state_changed = false;
        self.airplane_mode_toggled = false;
        self.mobile_data_reenabled = false;
    }

    /// Who most plausibly fixed the stall, judged only from side signals.
    pub fn recovered_reason(&self, valid: bool) -> RecoveredReason {
        if !valid {
            return RecoveredReason::None;
        }
        if self.radio_state_changed {
            if self.airplane_mode_toggled {
                RecoveredReason::User
            } else if self.last_action <= RecoveryAction::Cleanup {
                RecoveredReason::Modem
            } else {
                RecoveredReason::Dsrm
            }
        } else if self.mobile_data_reenabled {
            RecoveredReason::User
        } else {
            RecoveredReason::Dsrm
        }
    }
}
