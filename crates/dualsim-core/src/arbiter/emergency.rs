//! Emergency data override.
//!
//! An override pins the preferred slot while an emergency call needs a
//! specific modem's control plane. Only one is outstanding at a time.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use dualsim_common::SlotId;

pub struct EmergencyOverrideRequest {
    pub slot: SlotId,
    /// How long the override outlives the call.
    pub override_after_call_ends: Duration,
    /// The call has not originated yet; the override waits for it.
    pub pending_originating_call: bool,
    completion: Option<Sender<bool>>,
}

impl EmergencyOverrideRequest {
    /// Returns the request and the receiver its completion lands on.
    pub fn new(
        slot: SlotId,
        override_after_call_ends: Duration,
        pending_originating_call: bool,
    ) -> (Self, Receiver<bool>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                slot,
                override_after_call_ends,
                pending_originating_call,
                completion: Some(tx),
            },
            rx,
        )
    }

    /// Resolve the completion. Later calls are ignored.
    pub fn complete(&mut self, ok: bool) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(ok);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completion.is_none()
    }
}

impl std::fmt::Debug for EmergencyOverrideRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyOverrideRequest")
            .field("slot", &self.slot)
            .field("override_after_call_ends", &self.override_after_call_ends)
            .field("pending_originating_call", &self.pending_originating_call)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// The override currently in force.
#[derive(Debug)]
pub(crate) struct ActiveOverride {
    pub request: EmergencyOverrideRequest,
    /// A data-enabling command for the override slot is in flight; the
    /// completion waits for its ack.
    pub awaiting_ack: bool,
    /// A call on the override slot has started; its end arms the expiry.
    pub call_seen: bool,
}

impl ActiveOverride {
    pub fn new(request: EmergencyOverrideRequest) -> Self {
        Self {
            request,
            awaiting_ack: false,
            call_seen: false,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.request.slot
    }
}
