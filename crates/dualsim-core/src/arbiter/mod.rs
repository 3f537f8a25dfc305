//! # Preferred-Data Arbiter
//!
//! Decides which slot carries default Internet traffic and drives the
//! modem so that exactly that decision is in force. Every input arrives as
//! an [`ArbiterEvent`] on one loop; modem acks and validation results come
//! back as events too, so nothing here is ever re-entered.
//!
//! Evaluation order is fixed: primary subscription, slot mapping, the
//! no-SIM fallback, then override > in-call > auto-selected > primary. The
//! active-slot set is recomputed every time and diffed against what was
//! last requested, so repeated evaluations with unchanged inputs send no
//! commands. Radio-on is the one reason that forces every command out
//! again.

mod auto_switch;
pub mod emergency;
pub mod event;

pub use emergency::EmergencyOverrideRequest;
pub use event::{
    ArbiterEvent, ArbiterSnapshot, ArbiterStats, ArbiterTimer, CommandKind, EvalReason,
    SlotSnapshot,
};

use std::collections::BTreeSet;
use std::ops::ControlFlow;

use crossbeam_channel::Sender;
use dualsim_common::error::{CommandError, OverrideError, RetryDisposition};
use dualsim_common::models::{CommandMode, NetworkRequest, PreferredDataState, SwitchReason};
use dualsim_common::protocol::ArbiterNotice;
use dualsim_common::{DEFAULT_EMERGENCY_SLOT, SlotId, SubId};
use quanta::{Clock, Instant};
use tracing::{debug, info, warn};

use crate::collab::{Collaborators, CommandReply, SettingKey};
use crate::config::{ArbiterConfig, AutoSwitchConfig};
use crate::phone_state::PhoneStateTracker;
use crate::registrants::Registrants;
use crate::registry::NetworkRequestRegistry;
use crate::timer::TimerQueue;
use auto_switch::AutoSwitchState;
use emergency::ActiveOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PreferredSource {
    NoSubscription,
    Override,
    InCall,
    Fallback,
}

pub struct PreferredDataArbiter {
    config: ArbiterConfig,
    auto_config: AutoSwitchConfig,
    collab: Collaborators,
    clock: Clock,
    mailbox: Sender<ArbiterEvent>,
    mode: CommandMode,

    registry: NetworkRequestRegistry,
    phones: PhoneStateTracker,
    /// Usable subscription per slot as of the last evaluation.
    slot_subs: Vec<Option<SubId>>,
    state: PreferredDataState,
    slot_in_call: Option<SlotId>,
    emergency: Option<ActiveOverride>,
    auto: AutoSwitchState,
    timers: TimerQueue<ArbiterTimer>,

    next_token: u64,
    slot_tokens: Vec<Option<u64>>,
    preferred_token: Option<u64>,
    sent_preferred: Option<SlotId>,
    deferred_until_call_end: BTreeSet<SlotId>,
    deferred_until_sim_loaded: BTreeSet<SlotId>,

    registrants: Registrants<ArbiterNotice>,
    stats: ArbiterStats,
}

impl PreferredDataArbiter {
    /// `mailbox` must feed back into this arbiter's own loop; command
    /// completions and validation results are posted there.
    pub fn new(
        config: ArbiterConfig,
        auto_config: AutoSwitchConfig,
        collab: Collaborators,
        clock: Clock,
        mailbox: Sender<ArbiterEvent>,
    ) -> Self {
        let mode = config.command_mode.unwrap_or_else(|| {
            if collab.radio.supports_preferred_data_slot() {
                CommandMode::PreferredData
            } else {
                CommandMode::AllowData
            }
        });
        let slot_count = collab.subscriptions.active_modem_count();
        info!(?mode, slots = slot_count, "preferred-data arbiter created");

        Self {
            config,
            auto_config,
            collab,
            clock,
            mailbox,
            mode,
            registry: NetworkRequestRegistry::new(),
            phones: PhoneStateTracker::new(slot_count),
            slot_subs: vec![None; slot_count],
            state: PreferredDataState::default(),
            slot_in_call: None,
            emergency: None,
            auto: AutoSwitchState::default(),
            timers: TimerQueue::new(),
            next_token: 1,
            slot_tokens: vec![None; slot_count],
            preferred_token: None,
            sent_preferred: None,
            deferred_until_call_end: BTreeSet::new(),
            deferred_until_sim_loaded: BTreeSet::new(),
            registrants: Registrants::new(),
            stats: ArbiterStats::default(),
        }
    }

    /// Pull initial registration for every slot and run the first
    /// evaluation.
    pub fn start(&mut self) {
        for slot in 0..self.phones.slot_count() {
            let slot = SlotId(slot);
            let reg = self.collab.subscriptions.registration_state(slot);
            self.phones.set_registration(slot, reg);
        }
        self.evaluate(EvalReason::SubscriptionMapping);
        self.evaluate_auto_switch();
    }

    pub fn handle(&mut self, event: ArbiterEvent) {
        match event {
            ArbiterEvent::RequestAdded(request) => {
                if self.registry.add(request) {
                    self.evaluate(EvalReason::RequestsChanged);
                }
            }
            ArbiterEvent::RequestRemoved(request) => {
                if self.registry.remove(&request) {
                    self.evaluate(EvalReason::RequestsChanged);
                }
            }
            ArbiterEvent::SubscriptionMappingChanged => {
                self.evaluate(EvalReason::SubscriptionMapping);
                self.evaluate_auto_switch();
            }
            ArbiterEvent::ServiceStateChanged(slot) => self.on_service_state_changed(slot),
            ArbiterEvent::VoiceCallStateChanged => self.on_voice_call_state_changed(),
            ArbiterEvent::EmergencyOverrideRequested(request) => {
                self.on_emergency_override_requested(request)
            }
            ArbiterEvent::ValidationResult {
                sub,
                outcome,
                generation,
            } => self.on_validation_result(sub, outcome, generation),
            ArbiterEvent::RadioOn => {
                info!("radio on, re-issuing data commands");
                self.evaluate(EvalReason::RadioOn);
            }
            ArbiterEvent::SimLoaded(slot) => {
                if self.deferred_until_sim_loaded.remove(&slot) {
                    debug!(%slot, "SIM loaded, releasing deferred command");
                    self.reissue(slot);
                }
            }
            ArbiterEvent::ModemCountChanged(count) => self.on_modem_count_changed(count),
            ArbiterEvent::DataSettingsChanged => {
                self.evaluate(EvalReason::DataSettings);
                self.evaluate_auto_switch();
            }
            ArbiterEvent::DefaultNetworkChanged(transport) => {
                self.auto.default_transport = transport;
                self.evaluate_auto_switch();
            }
            ArbiterEvent::SetOpportunisticData {
                sub,
                need_validation,
                reply,
            } => self.set_opportunistic_data(sub, need_validation, reply),
            ArbiterEvent::ReestablishInternet { slot } => self.on_reestablish_internet(slot),
            ArbiterEvent::CommandDone {
                slot,
                kind,
                token,
                result,
            } => self.on_command_done(slot, kind, token, result),
            ArbiterEvent::Subscribe { notices, current } => {
                self.registrants.add(notices);
                let _ = current.send(self.state);
            }
            ArbiterEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            ArbiterEvent::Shutdown => {}
        }
    }

    /// Fire every timer that is due. Returns how many fired.
    pub fn fire_due_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.timers.pop_due(self.clock.now()) {
            self.on_timer(timer);
            fired += 1;
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn state(&self) -> PreferredDataState {
        self.state
    }

    pub fn mode(&self) -> CommandMode {
        self.mode
    }

    pub fn phones(&self) -> &PhoneStateTracker {
        &self.phones
    }

    pub fn stats(&self) -> &ArbiterStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ArbiterSnapshot {
        let slots = self
            .phones
            .slots()
            .map(|slot| {
                let s = self.phones.get(slot).copied().unwrap_or_default();
                SlotSnapshot {
                    slot,
                    sub: self.sub_in(slot),
                    requested_active: s.requested_active,
                    active: s.active,
                    registration: s.registration,
                }
            })
            .collect();
        ArbiterSnapshot {
            mode: self.mode,
            state: self.state,
            slots,
            slot_in_call: self.slot_in_call,
            emergency_slot: self.emergency.as_ref().map(|o| o.slot()),
            auto_switch_engaged: self.auto.engaged,
            auto_switch_failures: self.auto.failures,
            outstanding_requests: self.registry.len(),
            stats: self.stats.clone(),
        }
    }

    // ─── Evaluation ──────────────────────────────────────────────────────

    /// Recompute the preferred slot and the active-slot set. Returns
    /// whether anything observable changed.
    pub fn evaluate(&mut self, reason: EvalReason) -> bool {
        self.stats.evaluations += 1;
        let mut diff = self.mode == CommandMode::AllowData && reason == EvalReason::RequestsChanged;

        let primary = self
            .collab
            .subscriptions
            .default_data_subscription()
            .filter(|s| s.is_usable());
        if primary != self.state.primary_sub {
            info!(old = ?self.state.primary_sub, new = ?primary, "primary data subscription changed");
            self.state.primary_sub = primary;
            self.state.auto_selected_sub = None;
            self.state.last_switch_reason = SwitchReason::Manual;
            self.auto.engaged = false;
            self.cancel_pending_auto_switch();
        }

        for idx in 0..self.slot_subs.len() {
            let slot = SlotId(idx);
            let sub = self
                .collab
                .subscriptions
                .subscription_for_slot(slot)
                .filter(|s| s.is_usable());
            let cached = self.slot_subs[idx];
            if cached == sub {
                continue;
            }
            debug!(%slot, old = ?cached, new = ?sub, "slot subscription changed");
            if cached.is_some() && cached == self.state.auto_selected_sub {
                info!(%slot, "auto-selected subscription left its slot, clearing");
                self.state.auto_selected_sub = None;
                self.auto.engaged = false;
            }
            self.slot_subs[idx] = sub;
            diff = true;
        }

        let old = (self.state.preferred_slot, self.state.preferred_sub);
        let (slot, sub, source) = self.compute_preferred();
        self.state.preferred_slot = Some(slot);
        self.state.preferred_sub = sub;

        if old != (Some(slot), sub) {
            if source == PreferredSource::InCall {
                self.state.last_switch_reason = SwitchReason::InCall;
            }
            diff = true;
            self.stats.preferred_changes += 1;
            info!(
                %slot,
                sub = ?sub,
                source = ?source,
                reason = reason.as_str(),
                switch_reason = self.state.last_switch_reason.as_str(),
                "preferred data slot changed"
            );
            self.registrants
                .notify(&ArbiterNotice::PreferredDataChanged(self.state));
        } else {
            debug!(reason = reason.as_str(), %slot, "preferred data unchanged");
        }

        self.apply_active_slots(reason == EvalReason::RadioOn);
        diff
    }

    fn compute_preferred(&self) -> (SlotId, Option<SubId>, PreferredSource) {
        let subs = &self.collab.subscriptions;
        let any_active = self
            .slot_subs
            .iter()
            .flatten()
            .any(|s| subs.is_subscription_active(*s));
        if !any_active {
            return (DEFAULT_EMERGENCY_SLOT, None, PreferredSource::NoSubscription);
        }

        if let Some(ov) = &self.emergency {
            let slot = ov.slot();
            return (slot, self.sub_in(slot), PreferredSource::Override);
        }

        if let Some(call_slot) = self.slot_in_call {
            if self.should_follow_call(call_slot) {
                return (call_slot, self.sub_in(call_slot), PreferredSource::InCall);
            }
        }

        let fallback = match self.state.auto_selected_sub {
            Some(sub) if subs.is_subscription_active(sub) => Some(sub),
            _ => self.state.primary_sub,
        };
        if let Some(found) = fallback.and_then(|sub| self.slot_of_active(sub).map(|slot| (slot, sub)))
        {
            return (found.0, Some(found.1), PreferredSource::Fallback);
        }

        // No usable primary: take the first slot with an active subscription.
        let first = self.slot_subs.iter().enumerate().find_map(|(idx, sub)| {
            sub.filter(|s| subs.is_subscription_active(*s))
                .map(|s| (SlotId(idx), s))
        });
        match first {
            Some((slot, sub)) => (slot, Some(sub), PreferredSource::Fallback),
            None => (DEFAULT_EMERGENCY_SLOT, None, PreferredSource::NoSubscription),
        }
    }

    /// Data follows a voice call onto its slot only when IMS cannot carry
    /// the call across SIMs and the call's subscription allows it.
    fn should_follow_call(&self, call_slot: SlotId) -> bool {
        if self
            .collab
            .calls
            .ims_registration_tech(call_slot)
            .tolerates_data_handover()
        {
            return false;
        }
        let Some(sub) = self.sub_in(call_slot) else {
            return false;
        };
        let settings = &self.collab.settings;
        settings.get_or_default(SettingKey::UserDataEnabled(sub))
            && settings.get_or_default(SettingKey::DataDuringCall(sub))
    }

    fn sub_in(&self, slot: SlotId) -> Option<SubId> {
        self.slot_subs.get(slot.index()).copied().flatten()
    }

    fn slot_of_active(&self, sub: SubId) -> Option<SlotId> {
        if !self.collab.subscriptions.is_subscription_active(sub) {
            return None;
        }
        self.slot_subs
            .iter()
            .position(|s| *s == Some(sub))
            .map(SlotId)
    }

    fn slot_for_request(&self, request: &NetworkRequest) -> Option<SlotId> {
        match request.target {
            Some(sub) => self.slot_of_active(sub),
            None => self.state.preferred_slot,
        }
    }

    // ─── Active slots and modem commands ─────────────────────────────────

    fn apply_active_slots(&mut self, force: bool) {
        let now = self.clock.now();
        match self.mode {
            CommandMode::PreferredData => {
                for idx in 0..self.phones.slot_count() {
                    self.phones.request(SlotId(idx), true, now);
                }
                if let Some(slot) = self.state.preferred_slot {
                    if force || self.sent_preferred != Some(slot) {
                        self.sent_preferred = Some(slot);
                        self.issue(slot, CommandKind::SetPreferred);
                    }
                }
            }
            CommandMode::AllowData => {
                let desired = self.desired_active_set();
                let slots: Vec<SlotId> = self.phones.slots().collect();
                for &slot in slots.iter().filter(|s| !desired.contains(s)) {
                    self.switch_slot(slot, false, force, now);
                }
                for &slot in &desired {
                    self.switch_slot(slot, true, force, now);
                }
            }
        }
    }

    /// Slots that should be attached, by priority: the voice-call slot,
    /// slots targeted by outstanding requests, then the preferred slot.
    fn desired_active_set(&self) -> Vec<SlotId> {
        let count = self.phones.slot_count();
        let cap = self.config.max_data_attach;
        if cap >= count {
            return self.phones.slots().collect();
        }

        let mut set = Vec::with_capacity(cap);
        if let Some(slot) = self.slot_in_call.filter(|s| self.phones.contains(*s)) {
            set.push(slot);
        }
        if set.len() < cap {
            self.registry.for_each_targeting_slot(
                |request| self.slot_for_request(request),
                |slot| {
                    if !set.contains(&slot) {
                        set.push(slot);
                    }
                    if set.len() >= cap {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
            );
        }
        if set.len() < cap {
            if let Some(slot) = self.state.preferred_slot {
                if !set.contains(&slot) {
                    set.push(slot);
                }
            }
        }
        set
    }

    fn switch_slot(&mut self, slot: SlotId, active: bool, force: bool, now: Instant) {
        let changed = self.phones.request(slot, active, now);
        if changed || force {
            let kind = if active {
                CommandKind::Activate
            } else {
                CommandKind::Deactivate
            };
            self.issue(slot, kind);
        }
    }

    fn issue(&mut self, slot: SlotId, kind: CommandKind) {
        self.timers.cancel(&ArbiterTimer::CommandRetry(slot));
        self.deferred_until_call_end.remove(&slot);
        self.deferred_until_sim_loaded.remove(&slot);

        let token = self.next_token;
        self.next_token += 1;
        match kind {
            CommandKind::SetPreferred => self.preferred_token = Some(token),
            _ => {
                if let Some(t) = self.slot_tokens.get_mut(slot.index()) {
                    *t = Some(token);
                }
            }
        }
        if let Some(ov) = self.emergency.as_mut() {
            if ov.slot() == slot && kind.enables_data() {
                ov.awaiting_ack = true;
            }
        }
        self.stats.commands_sent += 1;
        debug!(%slot, ?kind, token, "issuing modem command");

        let tx = self.mailbox.clone();
        let reply: CommandReply = Box::new(move |result| {
            let _ = tx.send(ArbiterEvent::CommandDone {
                slot,
                kind,
                token,
                result,
            });
        });
        let radio = &self.collab.radio;
        match kind {
            CommandKind::Activate => radio.activate(slot, reply),
            CommandKind::Deactivate => radio.deactivate(slot, reply),
            CommandKind::SetPreferred => radio.set_preferred_data_slot(slot, reply),
        }
    }

    /// Send the command the slot should currently have, if any.
    fn reissue(&mut self, slot: SlotId) {
        if !self.phones.contains(slot) {
            return;
        }
        match self.mode {
            CommandMode::PreferredData => {
                if self.state.preferred_slot == Some(slot) {
                    self.issue(slot, CommandKind::SetPreferred);
                }
            }
            CommandMode::AllowData => {
                let kind = if self.phones.is_requested_active(slot) {
                    CommandKind::Activate
                } else {
                    CommandKind::Deactivate
                };
                self.issue(slot, kind);
            }
        }
    }

    fn on_command_done(
        &mut self,
        slot: SlotId,
        kind: CommandKind,
        token: u64,
        result: Result<(), CommandError>,
    ) {
        let latest = match kind {
            CommandKind::SetPreferred => self.preferred_token,
            _ => self.slot_tokens.get(slot.index()).copied().flatten(),
        };
        if latest != Some(token) {
            debug!(%slot, ?kind, token, "ignoring superseded command completion");
            return;
        }

        let now = self.clock.now();
        match result {
            Ok(()) => {
                let moved = match kind {
                    CommandKind::Activate => self.phones.mark_applied(slot, true, now),
                    CommandKind::Deactivate => self.phones.mark_applied(slot, false, now),
                    CommandKind::SetPreferred => {
                        let mut moved = false;
                        for idx in 0..self.phones.slot_count() {
                            moved |= self.phones.mark_applied(SlotId(idx), true, now);
                        }
                        moved
                    }
                };
                if moved {
                    let active = self.phones.active_slots();
                    info!(?active, "active data slots changed");
                    self.registrants
                        .notify(&ArbiterNotice::ActiveSlotsChanged { active });
                }
                if kind.enables_data() {
                    self.resolve_override_ack(slot, true);
                }
            }
            Err(err) => {
                self.stats.command_failures += 1;
                if kind.enables_data() {
                    self.resolve_override_ack(slot, false);
                }
                // The unblocking event may already have been handled by the
                // time the failure lands; only defer while the block holds.
                match err.disposition() {
                    RetryDisposition::WaitForCallEnd
                        if self.collab.calls.active_call_slot().is_some() =>
                    {
                        warn!(%slot, ?kind, error = %err, "modem command deferred until call ends");
                        self.deferred_until_call_end.insert(slot);
                    }
                    RetryDisposition::WaitForSimLoaded if !self.sim_loaded(slot) => {
                        warn!(%slot, ?kind, error = %err, "modem command deferred until SIM loaded");
                        self.deferred_until_sim_loaded.insert(slot);
                    }
                    _ => {
                        warn!(%slot, ?kind, error = %err, retry_in = ?self.config.modem_retry, "modem command failed");
                        self.timers.schedule(
                            ArbiterTimer::CommandRetry(slot),
                            now + self.config.modem_retry,
                        );
                    }
                }
            }
        }
    }

    fn sim_loaded(&self, slot: SlotId) -> bool {
        let subs = &self.collab.subscriptions;
        subs.subscription_for_slot(slot)
            .is_some_and(|sub| subs.is_subscription_active(sub))
    }

    // ─── Voice calls and emergency override ──────────────────────────────

    fn on_voice_call_state_changed(&mut self) {
        let call = self.collab.calls.active_call_slot();
        let now = self.clock.now();

        if let Some(ov) = self.emergency.as_mut()
            && ov.request.pending_originating_call
        {
            if call == Some(ov.slot()) {
                if !ov.call_seen {
                    ov.call_seen = true;
                    self.timers.cancel(&ArbiterTimer::EmergencyOverrideExpired);
                    debug!(slot = %ov.slot(), "emergency call started on override slot");
                }
            } else if call.is_none() && ov.call_seen {
                let after = ov.request.override_after_call_ends;
                ov.request.pending_originating_call = false;
                self.timers
                    .schedule(ArbiterTimer::EmergencyOverrideExpired, now + after);
                info!(slot = %ov.slot(), ?after, "emergency call ended, override expiry armed");
            }
        }

        if call != self.slot_in_call {
            debug!(old = ?self.slot_in_call, new = ?call, "voice call slot changed");
            self.slot_in_call = call;
            self.evaluate(EvalReason::VoiceCall);
        }

        if call.is_none() {
            for slot in std::mem::take(&mut self.deferred_until_call_end) {
                self.reissue(slot);
            }
        }
    }

    fn on_emergency_override_requested(&mut self, mut request: EmergencyOverrideRequest) {
        let slot = request.slot;
        if !self.phones.contains(slot) {
            warn!(error = %OverrideError::InvalidSlot(slot), "rejecting emergency override");
            request.complete(false);
            return;
        }
        if let Some(active) = self.emergency.as_mut() {
            if active.slot() != slot {
                let err = OverrideError::Conflict {
                    active: active.slot(),
                    requested: slot,
                };
                warn!(error = %err, "rejecting emergency override");
                request.complete(false);
                return;
            }
            info!(%slot, reason = %OverrideError::Superseded, "replacing emergency override");
            active.request.complete(false);
        }

        let in_call = request.pending_originating_call
            && self.collab.calls.active_call_slot() == Some(slot);
        self.timers.cancel(&ArbiterTimer::EmergencyOverrideExpired);
        if !in_call {
            let delay = if request.pending_originating_call {
                self.config.emergency_override_timeout
            } else {
                request.override_after_call_ends
            };
            self.timers.schedule(
                ArbiterTimer::EmergencyOverrideExpired,
                self.clock.now() + delay,
            );
        }
        info!(%slot, pending_call = request.pending_originating_call, in_call, "emergency data override accepted");
        let mut active = ActiveOverride::new(request);
        active.call_seen = in_call;
        self.emergency = Some(active);

        self.evaluate(EvalReason::EmergencyOverride);
        if let Some(ov) = self.emergency.as_mut() {
            if !ov.awaiting_ack {
                ov.request.complete(true);
            }
        }
    }

    fn resolve_override_ack(&mut self, slot: SlotId, ok: bool) {
        if let Some(ov) = self.emergency.as_mut() {
            if ov.slot() == slot && ov.awaiting_ack {
                ov.awaiting_ack = false;
                ov.request.complete(ok);
            }
        }
    }

    fn on_emergency_override_expired(&mut self) {
        if let Some(mut ov) = self.emergency.take() {
            info!(slot = %ov.slot(), "emergency data override expired");
            ov.request.complete(false);
            self.evaluate(EvalReason::EmergencyOverride);
        }
    }

    // ─── Registration, modem topology, recovery loop-back ────────────────

    fn on_service_state_changed(&mut self, slot: SlotId) {
        if !self.phones.contains(slot) {
            debug!(%slot, "service state for unknown slot");
            return;
        }
        let reg = self.collab.subscriptions.registration_state(slot);
        if self.phones.set_registration(slot, reg) {
            debug!(%slot, registration = reg.as_str(), "registration changed");
        }
        self.evaluate(EvalReason::ServiceState);
        self.evaluate_auto_switch();
    }

    fn on_modem_count_changed(&mut self, count: usize) {
        let old = self.phones.slot_count();
        if count == old {
            return;
        }
        info!(old, new = count, "active modem count changed");
        self.phones.resize(count);
        self.slot_subs.resize(count, None);
        self.slot_tokens.resize(count, None);
        self.deferred_until_call_end.retain(|s| s.index() < count);
        self.deferred_until_sim_loaded.retain(|s| s.index() < count);
        self.timers
            .cancel_where(|t| matches!(t, ArbiterTimer::CommandRetry(s) if s.index() >= count));
        if self.slot_in_call.is_some_and(|s| s.index() >= count) {
            self.slot_in_call = None;
        }
        if self.sent_preferred.is_some_and(|s| s.index() >= count) {
            self.sent_preferred = None;
        }
        if self.emergency.as_ref().is_some_and(|o| o.slot().index() >= count) {
            if let Some(mut ov) = self.emergency.take() {
                warn!(slot = %ov.slot(), "emergency override slot removed");
                ov.request.complete(false);
                self.timers.cancel(&ArbiterTimer::EmergencyOverrideExpired);
            }
        }
        for idx in old..count {
            let slot = SlotId(idx);
            let reg = self.collab.subscriptions.registration_state(slot);
            self.phones.set_registration(slot, reg);
        }
        self.evaluate(EvalReason::ModemCount);
        self.evaluate_auto_switch();
    }

    fn on_reestablish_internet(&mut self, slot: SlotId) {
        if !self.phones.contains(slot) {
            warn!(%slot, "rebuild requested for unknown slot");
            return;
        }
        info!(%slot, "tearing down and rebuilding Internet data network");
        self.collab.data_network.reestablish_internet(slot);
        self.reissue(slot);
    }

    fn on_timer(&mut self, timer: ArbiterTimer) {
        match timer {
            ArbiterTimer::AutoSwitchStability {
                target,
                need_validation,
            } => self.on_stability_elapsed(target, need_validation),
            ArbiterTimer::AutoSwitchRetry => self.evaluate_auto_switch(),
            ArbiterTimer::CommandRetry(slot) => {
                debug!(%slot, "retrying modem command");
                self.reissue(slot);
            }
            ArbiterTimer::EmergencyOverrideExpired => self.on_emergency_override_expired(),
        }
    }
}
