//! Notices published by the two control loops.
//!
//! Subscribers receive these over channels; they are also the JSON shape the
//! scenario runner logs, so they carry serde tags like any other wire type.

use serde::{Deserialize, Serialize};

use crate::ids::SlotId;
use crate::models::PreferredDataState;
use crate::recovery::{RecoveredReason, RecoveryAction, StallRecord};

// ── Arbiter → dependents ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ArbiterNotice {
    /// Preferred slot or subscription changed. Also delivered once,
    /// synchronously, to every new subscriber.
    #[serde(rename = "preferred_data.changed")]
    PreferredDataChanged(PreferredDataState),

    /// A modem command landed and the set of active slots moved.
    #[serde(rename = "slots.active_changed")]
    ActiveSlotsChanged { active: Vec<SlotId> },
}

// ── Recovery manager → dependents ───────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RecoveryNotice {
    /// A rung was executed for the current stall.
    #[serde(rename = "stall.detected")]
    StallDetected { slot: SlotId, action: RecoveryAction },

    /// Validation passed after recovery had been triggered.
    #[serde(rename = "stall.recovered")]
    Recovered {
        reason: RecoveredReason,
        duration_ms: u64,
    },

    /// The terminal rung ran; nothing more happens until validation passes.
    #[serde(rename = "stall.exhausted")]
    AllStepsAttempted,

    #[serde(rename = "stall.record")]
    Record(StallRecord),
}
