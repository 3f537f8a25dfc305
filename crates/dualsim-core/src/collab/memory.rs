//! In-process collaborators.
//!
//! Each one keeps its state behind a lock so the test (or scenario runner)
//! can script it from one thread while the control loops read it from
//! theirs. The radio records every command and either acknowledges it
//! immediately or parks it until the driver completes it by hand.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dualsim_common::error::CommandError;
use dualsim_common::models::{
    ImsRegistrationTech, RegistrationState, SignalLevel, ValidationOutcome,
};
use dualsim_common::{SlotId, SubId};

use super::{
    CallMonitor, Collaborators, CommandReply, DataNetworkController, RadioChannel, SettingKey,
    SettingsStore, SignalSource, SubscriptionSource, ValidationCallback, Validator,
};

// ─── Radio ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioCommand {
    Activate(SlotId),
    Deactivate(SlotId),
    SetPreferredDataSlot(SlotId),
    PowerCycle(SlotId),
    ResetModem(SlotId),
    QueryDataCallList(SlotId),
}

type PowerCycleHook = Box<dyn Fn(SlotId) + Send + Sync>;

pub struct MemoryRadio {
    preferred_data_mode: bool,
    auto_complete: AtomicBool,
    log: Mutex<Vec<RadioCommand>>,
    pending: Mutex<VecDeque<(RadioCommand, CommandReply)>>,
    failures: Mutex<VecDeque<CommandError>>,
    power_cycle_hook: Mutex<Option<PowerCycleHook>>,
}

impl MemoryRadio {
    /// Allow/disallow-data radio that acknowledges every command at once.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Radio that takes the single preferred-data-slot command.
    pub fn with_preferred_data_slot() -> Self {
        Self::build(true)
    }

    fn build(preferred_data_mode: bool) -> Self {
        Self {
            preferred_data_mode,
            auto_complete: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            failures: Mutex::new(VecDeque::new()),
            power_cycle_hook: Mutex::new(None),
        }
    }

    /// When off, activate/deactivate/preferred-slot commands park until
    /// [`MemoryRadio::complete_next`] or [`MemoryRadio::complete_all`].
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::Relaxed);
    }

    /// Fail the next data command with `err`, regardless of auto-complete.
    pub fn fail_next(&self, err: CommandError) {
        lock(&self.failures).push_back(err);
    }

    /// Run `hook` whenever a power cycle is requested.
    pub fn on_power_cycle(&self, hook: impl Fn(SlotId) + Send + Sync + 'static) {
        *lock(&self.power_cycle_hook) = Some(Box::new(hook));
    }

    pub fn commands(&self) -> Vec<RadioCommand> {
        lock(&self.log).clone()
    }

    /// Drain the command log.
    pub fn take_commands(&self) -> Vec<RadioCommand> {
        std::mem::take(&mut *lock(&self.log))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn complete_next(&self, result: Result<(), CommandError>) -> Option<RadioCommand> {
        let (cmd, reply) = lock(&self.pending).pop_front()?;
        reply(result);
        Some(cmd)
    }

    pub fn complete_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain(..).collect();
        let n = drained.len();
        for (_, reply) in drained {
            reply(Ok(()));
        }
        n
    }

    fn submit(&self, cmd: RadioCommand, reply: CommandReply) {
        lock(&self.log).push(cmd);
        let failure = lock(&self.failures).pop_front();
        if let Some(err) = failure {
            reply(Err(err));
        } else if self.auto_complete.load(Ordering::Relaxed) {
            reply(Ok(()));
        } else {
            lock(&self.pending).push_back((cmd, reply));
        }
    }
}

impl Default for MemoryRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioChannel for MemoryRadio {
    fn supports_preferred_data_slot(&self) -> bool {
        self.preferred_data_mode
    }

    fn activate(&self, slot: SlotId, reply: CommandReply) {
        self.submit(RadioCommand::Activate(slot), reply);
    }

    fn deactivate(&self, slot: SlotId, reply: CommandReply) {
        self.submit(RadioCommand::Deactivate(slot), reply);
    }

    fn set_preferred_data_slot(&self, slot: SlotId, reply: CommandReply) {
        self.submit(RadioCommand::SetPreferredDataSlot(slot), reply);
    }

    fn power_cycle(&self, slot: SlotId) {
        lock(&self.log).push(RadioCommand::PowerCycle(slot));
        if let Some(hook) = lock(&self.power_cycle_hook).as_ref() {
            hook(slot);
        }
    }

    fn reset_modem(&self, slot: SlotId) {
        lock(&self.log).push(RadioCommand::ResetModem(slot));
    }

    fn query_data_call_list(&self, slot: SlotId) {
        lock(&self.log).push(RadioCommand::QueryDataCallList(slot));
    }
}

// ─── Subscriptions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SlotEntry {
    pub sub: Option<SubId>,
    pub active: bool,
    pub registration: RegistrationState,
}

#[derive(Debug, Default)]
struct SubscriptionTable {
    default_data: Option<SubId>,
    slots: Vec<SlotEntry>,
}

pub struct MemorySubscriptions {
    table: RwLock<SubscriptionTable>,
}

impl MemorySubscriptions {
    pub fn new(slot_count: usize) -> Self {
        Self {
            table: RwLock::new(SubscriptionTable {
                default_data: None,
                slots: vec![SlotEntry::default(); slot_count],
            }),
        }
    }

    pub fn set_default_data(&self, sub: Option<SubId>) {
        write(&self.table).default_data = sub;
    }

    /// Put an active SIM in `slot`, replacing whatever was there.
    pub fn insert_sim(&self, slot: SlotId, sub: SubId) {
        let mut t = write(&self.table);
        if let Some(entry) = t.slots.get_mut(slot.index()) {
            entry.sub = Some(sub);
            entry.active = true;
        }
    }

    pub fn remove_sim(&self, slot: SlotId) {
        let mut t = write(&self.table);
        if let Some(entry) = t.slots.get_mut(slot.index()) {
            entry.sub = None;
            entry.active = false;
            entry.registration = RegistrationState::NotRegistered;
        }
    }

    pub fn set_sub_active(&self, sub: SubId, active: bool) {
        let mut t = write(&self.table);
        for entry in t.slots.iter_mut().filter(|e| e.sub == Some(sub)) {
            entry.active = active;
        }
    }

    pub fn set_registration(&self, slot: SlotId, registration: RegistrationState) {
        if let Some(entry) = write(&self.table).slots.get_mut(slot.index()) {
            entry.registration = registration;
        }
    }

    pub fn set_modem_count(&self, count: usize) {
        write(&self.table).slots.resize(count, SlotEntry::default());
    }

    pub fn slot(&self, slot: SlotId) -> Option<SlotEntry> {
        read(&self.table).slots.get(slot.index()).cloned()
    }
}

impl SubscriptionSource for MemorySubscriptions {
    fn active_modem_count(&self) -> usize {
        read(&self.table).slots.len()
    }

    fn default_data_subscription(&self) -> Option<SubId> {
        read(&self.table).default_data
    }

    fn subscription_for_slot(&self, slot: SlotId) -> Option<SubId> {
        read(&self.table)
            .slots
            .get(slot.index())
            .and_then(|e| e.sub)
    }

    fn is_subscription_active(&self, sub: SubId) -> bool {
        read(&self.table)
            .slots
            .iter()
            .any(|e| e.sub == Some(sub) && e.active)
    }

    fn registration_state(&self, slot: SlotId) -> RegistrationState {
        read(&self.table)
            .slots
            .get(slot.index())
            .map(|e| e.registration)
            .unwrap_or_default()
    }
}

// ─── Validator ──────────────────────────────────────────────────────────

#[derive(Default)]
struct ValidatorState {
    in_flight: Option<(SubId, ValidationCallback)>,
    requests: Vec<(SubId, bool)>,
    auto_outcome: Option<ValidationOutcome>,
    stops: usize,
}

#[derive(Default)]
pub struct MemoryValidator {
    state: Mutex<ValidatorState>,
}

impl MemoryValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every future request with `outcome` immediately.
    pub fn set_auto_outcome(&self, outcome: Option<ValidationOutcome>) {
        lock(&self.state).auto_outcome = outcome;
    }

    /// Deliver `outcome` for the validation in flight.
    pub fn complete(&self, outcome: ValidationOutcome) -> Option<SubId> {
        let (sub, callback) = lock(&self.state).in_flight.take()?;
        callback(sub, outcome);
        Some(sub)
    }

    /// `(sub, need_validation)` for every request so far.
    pub fn requests(&self) -> Vec<(SubId, bool)> {
        lock(&self.state).requests.clone()
    }

    pub fn in_flight(&self) -> Option<SubId> {
        lock(&self.state).in_flight.as_ref().map(|(sub, _)| *sub)
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stops
    }
}

impl Validator for MemoryValidator {
    fn validate(
        &self,
        sub: SubId,
        _timeout: Duration,
        need_validation: bool,
        callback: ValidationCallback,
    ) {
        let immediate = {
            let mut s = lock(&self.state);
            s.requests.push((sub, need_validation));
            match s.auto_outcome {
                Some(outcome) => {
                    s.in_flight = None;
                    Some(outcome)
                }
                None => {
                    s.in_flight = Some((sub, callback));
                    return;
                }
            }
        };
        if let Some(outcome) = immediate {
            callback(sub, outcome);
        }
    }

    fn stop_validation(&self) {
        let mut s = lock(&self.state);
        s.in_flight = None;
        s.stops += 1;
    }

    fn is_validating(&self) -> bool {
        lock(&self.state).in_flight.is_some()
    }
}

// ─── Calls ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryCalls {
    call_slot: Mutex<Option<SlotId>>,
    ims_tech: Mutex<HashMap<SlotId, ImsRegistrationTech>>,
}

impl MemoryCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_call(&self, slot: Option<SlotId>) {
        *lock(&self.call_slot) = slot;
    }

    pub fn set_ims_tech(&self, slot: SlotId, tech: ImsRegistrationTech) {
        lock(&self.ims_tech).insert(slot, tech);
    }
}

impl CallMonitor for MemoryCalls {
    fn active_call_slot(&self) -> Option<SlotId> {
        *lock(&self.call_slot)
    }

    fn ims_registration_tech(&self, slot: SlotId) -> ImsRegistrationTech {
        lock(&self.ims_tech).get(&slot).copied().unwrap_or_default()
    }
}

// ─── Data network, signal, settings ─────────────────────────────────────

#[derive(Default)]
pub struct MemoryDataNetwork {
    disallowed: Mutex<HashMap<SlotId, bool>>,
    rebuilds: Mutex<Vec<SlotId>>,
}

impl MemoryDataNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_internet_allowed(&self, slot: SlotId, allowed: bool) {
        lock(&self.disallowed).insert(slot, !allowed);
    }

    pub fn rebuilds(&self) -> Vec<SlotId> {
        lock(&self.rebuilds).clone()
    }
}

impl DataNetworkController for MemoryDataNetwork {
    fn reestablish_internet(&self, slot: SlotId) {
        lock(&self.rebuilds).push(slot);
    }

    fn is_internet_data_allowed(&self, slot: SlotId) -> bool {
        !lock(&self.disallowed).get(&slot).copied().unwrap_or(false)
    }
}

/// Signal levels per slot; unknown slots read as `Great`.
#[derive(Default)]
pub struct MemorySignal {
    levels: Mutex<HashMap<SlotId, SignalLevel>>,
}

impl MemorySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_level(&self, slot: SlotId, level: SignalLevel) {
        lock(&self.levels).insert(slot, level);
    }
}

impl SignalSource for MemorySignal {
    fn signal_level(&self, slot: SlotId) -> SignalLevel {
        lock(&self.levels)
            .get(&slot)
            .copied()
            .unwrap_or(SignalLevel::Great)
    }
}

#[derive(Default)]
pub struct MemorySettings {
    values: RwLock<HashMap<SettingKey, bool>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_bool(&self, key: SettingKey) -> Option<bool> {
        read(&self.values).get(&key).copied()
    }

    fn set_bool(&self, key: SettingKey, value: bool) {
        write(&self.values).insert(key, value);
    }
}

// ─── Bundle ─────────────────────────────────────────────────────────────

/// A whole in-memory device.
pub struct MemoryDevice {
    pub radio: Arc<MemoryRadio>,
    pub subscriptions: Arc<MemorySubscriptions>,
    pub validator: Arc<MemoryValidator>,
    pub calls: Arc<MemoryCalls>,
    pub data_network: Arc<MemoryDataNetwork>,
    pub signal: Arc<MemorySignal>,
    pub settings: Arc<MemorySettings>,
}

impl MemoryDevice {
    pub fn new(slot_count: usize) -> Self {
        Self::with_radio(slot_count, MemoryRadio::new())
    }

    pub fn with_radio(slot_count: usize, radio: MemoryRadio) -> Self {
        Self {
            radio: Arc::new(radio),
            subscriptions: Arc::new(MemorySubscriptions::new(slot_count)),
            validator: Arc::new(MemoryValidator::new()),
            calls: Arc::new(MemoryCalls::new()),
            data_network: Arc::new(MemoryDataNetwork::new()),
            signal: Arc::new(MemorySignal::new()),
            settings: Arc::new(MemorySettings::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            radio: self.radio.clone(),
            subscriptions: self.subscriptions.clone(),
            validator: self.validator.clone(),
            calls: self.calls.clone(),
            data_network: self.data_network.clone(),
            signal: self.signal.clone(),
            settings: self.settings.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(m: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(m: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn radio_parks_commands_when_manual() {
        let radio = MemoryRadio::new();
        radio.set_auto_complete(false);
        let (tx, rx) = crossbeam_channel::unbounded();
        radio.activate(SlotId(1), Box::new(move |r| tx.send(r).unwrap()));
        assert_eq!(radio.pending_count(), 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(radio.complete_next(Ok(())), Some(RadioCommand::Activate(SlotId(1))));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn radio_injected_failure_wins_over_auto_complete() {
        let radio = MemoryRadio::new();
        radio.fail_next(CommandError::SimNotReady);
        let (tx, rx) = crossbeam_channel::unbounded();
        let tx2 = tx.clone();
        radio.deactivate(SlotId(0), Box::new(move |r| tx.send(r).unwrap()));
        radio.deactivate(SlotId(0), Box::new(move |r| tx2.send(r).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), Err(CommandError::SimNotReady));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn subscriptions_track_activity() {
        let subs = MemorySubscriptions::new(2);
        subs.insert_sim(SlotId(1), SubId(7));
        assert!(subs.is_subscription_active(SubId(7)));
        subs.set_sub_active(SubId(7), false);
        assert!(!subs.is_subscription_active(SubId(7)));
        assert_eq!(subs.subscription_for_slot(SlotId(1)), Some(SubId(7)));
        subs.remove_sim(SlotId(1));
        assert_eq!(subs.subscription_for_slot(SlotId(1)), None);
    }

    #[test]
    fn validator_replaces_in_flight() {
        let v = MemoryValidator::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let tx2 = tx.clone();
        v.validate(SubId(1), Duration::from_secs(1), true, Box::new(move |s, o| tx.send((s, o)).unwrap()));
        v.validate(SubId(2), Duration::from_secs(1), true, Box::new(move |s, o| tx2.send((s, o)).unwrap()));
        assert_eq!(v.in_flight(), Some(SubId(2)));
        v.complete(ValidationOutcome::Passed);
        assert_eq!(rx.try_recv().unwrap(), (SubId(2), ValidationOutcome::Passed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn settings_fall_back_to_key_defaults() {
        let s = MemorySettings::new();
        assert!(s.get_or_default(SettingKey::UserDataEnabled(SubId(1))));
        assert!(!s.get_or_default(SettingKey::AutoDataSwitch(SubId(1))));
        s.set_bool(SettingKey::AutoDataSwitch(SubId(1)), true);
        assert!(s.get_or_default(SettingKey::AutoDataSwitch(SubId(1))));
    }
}
