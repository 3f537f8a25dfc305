//! Per-slot modem state.
//!
//! `requested_active` is what the arbiter last asked the radio for;
//! `active` is what the radio has acknowledged. Only command completions
//! move `active`, and only registration events move `registration`.

use dualsim_common::SlotId;
use dualsim_common::models::RegistrationState;
use quanta::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotState {
    pub requested_active: bool,
    pub active: bool,
    pub registration: RegistrationState,
    pub last_requested_at: Option<Instant>,
    pub last_activated_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct PhoneStateTracker {
    slots: Vec<SlotState>,
}

impl PhoneStateTracker {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![SlotState::default(); slot_count],
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        (0..self.slots.len()).map(SlotId)
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        slot.index() < self.slots.len()
    }

    /// Grow or shrink to `count` slots. New slots start inactive and
    /// unregistered.
    pub fn resize(&mut self, count: usize) {
        self.slots.resize(count, SlotState::default());
    }

    pub fn get(&self, slot: SlotId) -> Option<&SlotState> {
        self.slots.get(slot.index())
    }

    pub fn registration(&self, slot: SlotId) -> RegistrationState {
        self.get(slot).map(|s| s.registration).unwrap_or_default()
    }

    /// Returns whether the registration changed.
    pub fn set_registration(&mut self, slot: SlotId, registration: RegistrationState) -> bool {
        match self.slots.get_mut(slot.index()) {
            Some(s) if s.registration != registration => {
                s.registration = registration;
                true
            }
            _ => false,
        }
    }

    pub fn is_requested_active(&self, slot: SlotId) -> bool {
        self.get(slot).is_some_and(|s| s.requested_active)
    }

    /// Record a transition request. Returns whether it differs from the
    /// previous request.
    pub fn request(&mut self, slot: SlotId, active: bool, now: Instant) -> bool {
        match self.slots.get_mut(slot.index()) {
            Some(s) => {
                let changed = s.requested_active != active;
                s.requested_active = active;
                s.last_requested_at = Some(now);
                changed
            }
            None => false,
        }
    }

    /// Apply an acknowledged command. Returns whether `active` flipped.
    pub fn mark_applied(&mut self, slot: SlotId, active: bool, now: Instant) -> bool {
        match self.slots.get_mut(slot.index()) {
            Some(s) => {
                let changed = s.active != active;
                s.active = active;
                if active && changed {
                    s.last_activated_at = Some(now);
                }
                changed
            }
            None => false,
        }
    }

    pub fn is_active(&self, slot: SlotId) -> bool {
        self.get(slot).is_some_and(|s| s.active)
    }

    pub fn active_slots(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.active)
            .map(|(i, _)| SlotId(i))
            .collect()
    }
}
