//! Error types shared across the control plane.

use thiserror::Error;

use crate::ids::{SlotId, SubId};

// ── Modem commands ──────────────────────────────────────────────────

/// Failure reported by the radio for an activate/deactivate/preferred-slot
/// command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("radio busy")]
    RadioBusy,
    #[error("operation not allowed during voice call")]
    BlockedByVoiceCall,
    #[error("SIM not ready")]
    SimNotReady,
    #[error("invalid slot {0}")]
    InvalidSlot(SlotId),
    #[error("command failed: {0}")]
    Failed(String),
}

/// How a failed command gets another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Timed retry after the fixed modem back-off.
    Retry,
    /// Re-sent when the voice call ends.
    WaitForCallEnd,
    /// Re-sent when the SIM reports loaded.
    WaitForSimLoaded,
}

impl CommandError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            CommandError::BlockedByVoiceCall => RetryDisposition::WaitForCallEnd,
            CommandError::SimNotReady => RetryDisposition::WaitForSimLoaded,
            _ => RetryDisposition::Retry,
        }
    }
}

// ── Requests rejected synchronously ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OverrideError {
    #[error("emergency override already active for {active}, rejecting {requested}")]
    Conflict { active: SlotId, requested: SlotId },
    #[error("no modem at {0}")]
    InvalidSlot(SlotId),
    #[error("override superseded by a newer request")]
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpportunisticError {
    #[error("{0} is not an active subscription")]
    InactiveSubscription(SubId),
    #[error("validation failed for {0}")]
    ValidationFailed(SubId),
    #[error("request replaced by a newer one")]
    Replaced,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispositions() {
        assert_eq!(
            CommandError::BlockedByVoiceCall.disposition(),
            RetryDisposition::WaitForCallEnd
        );
        assert_eq!(
            CommandError::SimNotReady.disposition(),
            RetryDisposition::WaitForSimLoaded
        );
        assert_eq!(CommandError::RadioBusy.disposition(), RetryDisposition::Retry);
        assert_eq!(
            CommandError::Failed("generic".into()).disposition(),
            RetryDisposition::Retry
        );
    }

    #[test]
    fn conflict_message_names_both_slots() {
        let err = OverrideError::Conflict {
            active: SlotId(1),
            requested: SlotId(0),
        };
        assert_eq!(
            err.to_string(),
            "emergency override already active for slot1, rejecting slot0"
        );
    }
}
