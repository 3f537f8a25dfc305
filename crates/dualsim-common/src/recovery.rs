//! Data-stall recovery ladder and episode records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordinal 2 belonged to a re-register rung that no longer exists. It stays
/// reserved so ordinals reported to external tooling keep their meaning.
pub const RESERVED_REREGISTER_ORDINAL: u8 = 2;

/// Number of ordinals in the ladder, counting the reserved gap.
pub const RECOVERY_ORDINAL_COUNT: usize = 5;

/// One rung of the escalating recovery ladder.
///
/// Ordering follows escalation: `GetDataCallList < Cleanup < RadioRestart <
/// ResetModem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecoveryAction {
    GetDataCallList = 0,
    Cleanup = 1,
    RadioRestart = 3,
    ResetModem = 4,
}

impl RecoveryAction {
    pub const LADDER: [RecoveryAction; 4] = [
        RecoveryAction::GetDataCallList,
        RecoveryAction::Cleanup,
        RecoveryAction::RadioRestart,
        RecoveryAction::ResetModem,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Map an external ordinal back to a rung. The reserved ordinal and
    /// anything out of range map to `None`.
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            0 => Some(RecoveryAction::GetDataCallList),
            1 => Some(RecoveryAction::Cleanup),
            3 => Some(RecoveryAction::RadioRestart),
            4 => Some(RecoveryAction::ResetModem),
            _ => None,
        }
    }

    /// Next rung up, or `None` after the terminal rung.
    pub fn next(self) -> Option<Self> {
        match self {
            RecoveryAction::GetDataCallList => Some(RecoveryAction::Cleanup),
            RecoveryAction::Cleanup => Some(RecoveryAction::RadioRestart),
            RecoveryAction::RadioRestart => Some(RecoveryAction::ResetModem),
            RecoveryAction::ResetModem => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::GetDataCallList => "get_data_call_list",
            RecoveryAction::Cleanup => "cleanup",
            RecoveryAction::RadioRestart => "radio_restart",
            RecoveryAction::ResetModem => "reset_modem",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who most plausibly fixed a stall. Derived for telemetry only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveredReason {
    #[default]
    None,
    /// The recovery manager's own actions.
    Dsrm,
    /// The modem restarted the radio on its own.
    Modem,
    /// The user toggled airplane mode or mobile data.
    User,
}

impl RecoveredReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveredReason::None => "none",
            RecoveredReason::Dsrm => "dsrm",
            RecoveredReason::Modem => "modem",
            RecoveredReason::User => "user",
        }
    }
}

/// One telemetry entry, emitted whenever a rung runs and when a stall ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StallRecord {
    pub action: RecoveryAction,
    pub recovered: bool,
    pub duration_ms: u64,
    pub reason: RecoveredReason,
    /// Set on the first validation result seen after a rung ran.
    pub first_validation_after_recovery: bool,
    pub recorded_at: DateTime<Utc>,
}
