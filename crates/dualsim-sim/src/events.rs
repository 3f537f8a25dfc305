//! Device inputs shared by scripts, walks and the soak driver.
//!
//! A [`DeviceEvent`] is one thing that happens to the phone. It mutates the
//! in-memory collaborators and then tells the loops, through an
//! [`EventSink`]: synchronously for a [`SimDevice`], over the mailboxes for a
//! live control plane.

use std::time::Duration;

use crossbeam_channel::Receiver;
use dualsim_common::error::CommandError;
use dualsim_common::models::{
    ImsRegistrationTech, RadioPowerState, RegistrationState, SignalLevel, ValidationOutcome,
};
use dualsim_common::{SlotId, SubId};
use dualsim_core::arbiter::{ArbiterEvent, EmergencyOverrideRequest};
use dualsim_core::collab::memory::{MemoryDevice, MemorySubscriptions};
use dualsim_core::collab::{SettingKey, SettingsStore};
use dualsim_core::recovery::RecoveryEvent;
use rand::RngExt as _;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::device::SimDevice;

/// How long an emergency override outlives its call unless a script says
/// otherwise.
pub const OVERRIDE_AFTER_CALL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Registration(SlotId, RegistrationState),
    Signal(SlotId, SignalLevel),
    /// Validation verdict for the Internet path.
    Validation(bool),
    Advance(Duration),
    /// A SIM is inserted and registers home.
    InsertSim(SlotId, SubId),
    RemoveSim(SlotId),
    DefaultData(Option<SubId>),
    CallStarted(SlotId, ImsRegistrationTech),
    CallEnded,
    EmergencyOverride {
        slot: SlotId,
        after_call: Duration,
        pending_call: bool,
    },
    MobileData(SubId, bool),
    DataDuringCall(SubId, bool),
    Airplane(bool),
    RadioPower(RadioPowerState),
    ValidatorOutcome(ValidationOutcome),
    CommandFailure(CommandError),
}

/// Where events land once the collaborators are updated.
pub trait EventSink {
    fn device(&self) -> &MemoryDevice;
    fn arbiter(&mut self, event: ArbiterEvent);
    fn recovery(&mut self, event: RecoveryEvent);
    fn advance(&mut self, d: Duration);
}

impl EventSink for SimDevice {
    fn device(&self) -> &MemoryDevice {
        &self.device
    }

    fn arbiter(&mut self, event: ArbiterEvent) {
        self.arbiter_event(event);
    }

    fn recovery(&mut self, event: RecoveryEvent) {
        self.recovery_event(event);
    }

    fn advance(&mut self, d: Duration) {
        SimDevice::advance(self, d);
    }
}

/// Apply `event`. Returns the completion receiver of an emergency override.
pub fn apply(sink: &mut impl EventSink, event: DeviceEvent) -> Option<Receiver<bool>> {
    match event {
        DeviceEvent::Registration(slot, reg) => {
            sink.device().subscriptions.set_registration(slot, reg);
            sink.arbiter(ArbiterEvent::ServiceStateChanged(slot));
        }
        DeviceEvent::Signal(slot, level) => sink.device().signal.set_level(slot, level),
        DeviceEvent::Validation(valid) => sink.recovery(RecoveryEvent::ValidationStatus { valid }),
        DeviceEvent::Advance(d) => sink.advance(d),
        DeviceEvent::InsertSim(slot, sub) => {
            let subs = &sink.device().subscriptions;
            subs.insert_sim(slot, sub);
            subs.set_registration(slot, RegistrationState::Home);
            sink.arbiter(ArbiterEvent::SubscriptionMappingChanged);
            sink.arbiter(ArbiterEvent::SimLoaded(slot));
        }
        DeviceEvent::RemoveSim(slot) => {
            sink.device().subscriptions.remove_sim(slot);
            sink.arbiter(ArbiterEvent::SubscriptionMappingChanged);
        }
        DeviceEvent::DefaultData(sub) => {
            sink.device().subscriptions.set_default_data(sub);
            sink.arbiter(ArbiterEvent::SubscriptionMappingChanged);
        }
        DeviceEvent::CallStarted(slot, tech) => {
            sink.device().calls.set_ims_tech(slot, tech);
            sink.device().calls.set_call(Some(slot));
            sink.arbiter(ArbiterEvent::VoiceCallStateChanged);
        }
        DeviceEvent::CallEnded => {
            sink.device().calls.set_call(None);
            sink.arbiter(ArbiterEvent::VoiceCallStateChanged);
        }
        DeviceEvent::EmergencyOverride {
            slot,
            after_call,
            pending_call,
        } => {
            let (request, done) = EmergencyOverrideRequest::new(slot, after_call, pending_call);
            sink.arbiter(ArbiterEvent::EmergencyOverrideRequested(request));
            return Some(done);
        }
        DeviceEvent::MobileData(sub, enabled) => {
            sink.device()
                .settings
                .set_bool(SettingKey::UserDataEnabled(sub), enabled);
            sink.arbiter(ArbiterEvent::DataSettingsChanged);
            sink.recovery(RecoveryEvent::MobileDataEnabledChanged(enabled));
        }
        DeviceEvent::DataDuringCall(sub, enabled) => {
            sink.device()
                .settings
                .set_bool(SettingKey::DataDuringCall(sub), enabled);
            sink.arbiter(ArbiterEvent::DataSettingsChanged);
        }
        DeviceEvent::Airplane(on) => {
            sink.recovery(RecoveryEvent::AirplaneModeChanged(on));
            let power = if on {
                RadioPowerState::Off
            } else {
                RadioPowerState::On
            };
            radio_power(sink, power);
        }
        DeviceEvent::RadioPower(power) => radio_power(sink, power),
        DeviceEvent::ValidatorOutcome(outcome) => {
            sink.device().validator.set_auto_outcome(Some(outcome));
        }
        DeviceEvent::CommandFailure(err) => sink.device().radio.fail_next(err),
    }
    None
}

fn radio_power(sink: &mut impl EventSink, power: RadioPowerState) {
    sink.recovery(RecoveryEvent::RadioPowerChanged(power));
    if power == RadioPowerState::On {
        sink.arbiter(ArbiterEvent::RadioOn);
    }
}

// ─── Random source ──────────────────────────────────────────────────────

const REGISTRATIONS: [RegistrationState; 4] = [
    RegistrationState::Home,
    RegistrationState::Roaming,
    RegistrationState::Searching,
    RegistrationState::NotRegistered,
];

const SIGNALS: [SignalLevel; 5] = [
    SignalLevel::NoneOrUnknown,
    SignalLevel::Poor,
    SignalLevel::Moderate,
    SignalLevel::Good,
    SignalLevel::Great,
];

const IMS_TECHS: [ImsRegistrationTech; 4] = [
    ImsRegistrationTech::Lte,
    ImsRegistrationTech::Nr,
    ImsRegistrationTech::Iwlan,
    ImsRegistrationTech::CrossSim,
];

/// Deterministic event generator. The same seed and the same subscription
/// table yield the same sequence.
#[derive(Debug)]
pub struct EventSource {
    rng: StdRng,
    slots: usize,
    sub_pool: i32,
    max_advance: Duration,
}

impl EventSource {
    /// Subscriptions `1..=sub_pool` circulate through `slots` slots.
    pub fn new(seed: u64, slots: usize, sub_pool: i32, max_advance: Duration) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            slots: slots.max(1),
            sub_pool: sub_pool.max(1),
            max_advance,
        }
    }

    fn pick<T: Clone>(&mut self, items: &[T]) -> T {
        items[self.rng.random_range(0..items.len())].clone()
    }

    fn slot(&mut self) -> SlotId {
        SlotId(self.rng.random_range(0..self.slots))
    }

    fn sub(&mut self) -> SubId {
        SubId(self.rng.random_range(1..=self.sub_pool))
    }

    /// A subscription not present in any slot, if the pool has one left.
    fn free_sub(&mut self, subs: &MemorySubscriptions) -> Option<SubId> {
        let used: Vec<SubId> = (0..self.slots)
            .filter_map(|i| subs.slot(SlotId(i)).and_then(|e| e.sub))
            .collect();
        let free: Vec<SubId> = (1..=self.sub_pool)
            .map(SubId)
            .filter(|s| !used.contains(s))
            .collect();
        if free.is_empty() {
            None
        } else {
            Some(self.pick(&free))
        }
    }

    /// Weighted draw. Validation and time dominate so stalls get a chance
    /// to climb the ladder between topology changes.
    pub fn next_event(&mut self, subs: &MemorySubscriptions) -> DeviceEvent {
        let roll = self.rng.random_range(0..100u32);
        match roll {
            0..=19 => DeviceEvent::Validation(self.rng.random_bool(0.3)),
            20..=39 => {
                let ms = self
                    .rng
                    .random_range(0..=self.max_advance.as_millis() as u64);
                DeviceEvent::Advance(Duration::from_millis(ms))
            }
            40..=51 => {
                let slot = self.slot();
                DeviceEvent::Registration(slot, self.pick(&REGISTRATIONS))
            }
            52..=57 => {
                let slot = self.slot();
                DeviceEvent::Signal(slot, self.pick(&SIGNALS))
            }
            58..=61 => {
                let slot = self.slot();
                match self.free_sub(subs) {
                    Some(sub) => DeviceEvent::InsertSim(slot, sub),
                    None => DeviceEvent::RemoveSim(slot),
                }
            }
            62..=64 => DeviceEvent::RemoveSim(self.slot()),
            65..=67 => {
                let sub = if self.rng.random_bool(0.1) {
                    None
                } else {
                    Some(self.sub())
                };
                DeviceEvent::DefaultData(sub)
            }
            68..=72 => {
                let slot = self.slot();
                DeviceEvent::CallStarted(slot, self.pick(&IMS_TECHS))
            }
            73..=77 => DeviceEvent::CallEnded,
            78..=81 => DeviceEvent::EmergencyOverride {
                // Occasionally one past the last modem, which must be refused.
                slot: SlotId(self.rng.random_range(0..=self.slots)),
                after_call: OVERRIDE_AFTER_CALL,
                pending_call: self.rng.random_bool(0.5),
            },
            82..=85 => {
                let sub = self.sub();
                DeviceEvent::MobileData(sub, self.rng.random_bool(0.7))
            }
            86..=88 => {
                let sub = self.sub();
                DeviceEvent::DataDuringCall(sub, self.rng.random_bool(0.5))
            }
            89..=92 => DeviceEvent::Airplane(self.rng.random_bool(0.5)),
            93..=96 => DeviceEvent::ValidatorOutcome(self.pick(&[
                ValidationOutcome::Passed,
                ValidationOutcome::Passed,
                ValidationOutcome::Failed,
                ValidationOutcome::NetworkAvailable,
            ])),
            _ => DeviceEvent::CommandFailure(self.pick(&[
                CommandError::RadioBusy,
                CommandError::BlockedByVoiceCall,
                CommandError::SimNotReady,
            ])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSetup;
    use dualsim_core::config::DaemonConfig;

    #[test]
    fn source_is_deterministic_for_seed() {
        let subs = MemorySubscriptions::new(2);
        let mut a = EventSource::new(9, 2, 4, Duration::from_secs(1));
        let mut b = EventSource::new(9, 2, 4, Duration::from_secs(1));
        for _ in 0..200 {
            assert_eq!(a.next_event(&subs), b.next_event(&subs));
        }
    }

    #[test]
    fn inserts_only_free_subscriptions() {
        let subs = MemorySubscriptions::new(2);
        subs.insert_sim(SlotId(0), SubId(1));
        subs.insert_sim(SlotId(1), SubId(2));
        let mut source = EventSource::new(3, 2, 2, Duration::from_secs(1));
        for _ in 0..500 {
            assert!(!matches!(
                source.next_event(&subs),
                DeviceEvent::InsertSim(..)
            ));
        }
    }

    #[test]
    fn airplane_toggle_reaches_both_loops() {
        let mut sim = SimDevice::start(DeviceSetup::default().build(), DaemonConfig::default());
        sim.device.radio.take_commands();
        apply(&mut sim, DeviceEvent::Airplane(true));
        assert!(sim.device.radio.commands().is_empty());
        apply(&mut sim, DeviceEvent::Airplane(false));
        assert!(
            !sim.device.radio.commands().is_empty(),
            "radio on re-sends slot commands"
        );
    }

    #[test]
    fn override_returns_its_completion() {
        let mut sim = SimDevice::start(DeviceSetup::default().build(), DaemonConfig::default());
        let done = apply(
            &mut sim,
            DeviceEvent::EmergencyOverride {
                slot: SlotId(1),
                after_call: OVERRIDE_AFTER_CALL,
                pending_call: true,
            },
        )
        .unwrap();
        assert_eq!(done.try_recv(), Ok(true));
        assert_eq!(sim.preferred(), Some(SlotId(1)));
    }
}
