//! # Data-Stall Recovery
//!
//! Watches validation verdicts for the Internet network on the preferred
//! slot and walks an escalating ladder of recovery actions while the
//! network stays invalid:
//!
//! ```text
//! GET_DATA_CALL_LIST → CLEANUP → RADIO_RESTART → RESET_MODEM
//! ```
//!
//! Each executed rung (except the terminal one) arms a check timer for that
//! rung's delay. When it expires the preconditions are evaluated again
//! before the next rung runs. Rungs can be skipped by configuration, and
//! two side signals short-circuit the ladder: mobile data re-enabled during
//! a stall jumps to RADIO_RESTART, and a radio that came back on during a
//! stall jumps to RESET_MODEM. Validation passing resets everything.
//!
//! CLEANUP does not touch the data layer itself. It posts
//! [`ArbiterEvent::ReestablishInternet`] to the arbiter so that every
//! mutation of the active path goes through one loop.

pub mod event;
pub mod stall;

pub use event::{RecoveryEvent, RecoverySnapshot, RecoveryStats, RecoveryTimer, SkipReason};
pub use stall::StallState;

use chrono::Utc;
use crossbeam_channel::Sender;
use dualsim_common::SlotId;
use dualsim_common::models::{PreferredDataState, RadioPowerState};
use dualsim_common::protocol::RecoveryNotice;
use dualsim_common::recovery::{RecoveredReason, RecoveryAction, StallRecord};
use quanta::{Clock, Instant};
use tracing::{debug, info, warn};

use crate::arbiter::ArbiterEvent;
use crate::collab::Collaborators;
use crate::config::RecoveryConfig;
use crate::registrants::Registrants;
use crate::timer::TimerQueue;

pub struct DataStallRecoveryManager {
    config: RecoveryConfig,
    collab: Collaborators,
    clock: Clock,
    arbiter: Sender<ArbiterEvent>,

    slot: Option<SlotId>,
    internet_connected: bool,
    radio_power: RadioPowerState,
    mobile_data_enabled: bool,
    stall: StallState,
    timers: TimerQueue<RecoveryTimer>,

    registrants: Registrants<RecoveryNotice>,
    stats: RecoveryStats,
}

impl DataStallRecoveryManager {
    /// `arbiter` is the arbiter's mailbox; CLEANUP is posted there.
    pub fn new(
        config: RecoveryConfig,
        collab: Collaborators,
        clock: Clock,
        arbiter: Sender<ArbiterEvent>,
        preferred: PreferredDataState,
    ) -> Self {
        info!(slot = ?preferred.preferred_slot, "data stall recovery manager created");
        let mut manager = Self {
            config,
            collab,
            clock,
            arbiter,
            slot: preferred.preferred_slot,
            internet_connected: false,
            radio_power: RadioPowerState::On,
            mobile_data_enabled: true,
            stall: StallState::default(),
            timers: TimerQueue::new(),
            registrants: Registrants::new(),
            stats: RecoveryStats::default(),
        };
        manager.set_action(RecoveryAction::GetDataCallList);
        manager
    }

    pub fn handle(&mut self, event: RecoveryEvent) {
        match event {
            RecoveryEvent::ValidationStatus { valid } => self.on_validation_status(valid),
            RecoveryEvent::InternetNetworkChanged { connected } => {
                debug!(connected, "internet network connection changed");
                self.internet_connected = connected;
            }
            RecoveryEvent::PreferredDataChanged(state) => self.on_preferred_data_changed(state),
            RecoveryEvent::RadioPowerChanged(power) => self.on_radio_power_changed(power),
            RecoveryEvent::AirplaneModeChanged(enabled) => {
                if enabled && self.stall.in_stall() {
                    debug!("airplane mode enabled during data stall");
                    self.stall.airplane_mode_toggled = true;
                }
            }
            RecoveryEvent::MobileDataEnabledChanged(enabled) => {
                self.on_mobile_data_enabled_changed(enabled)
            }
            RecoveryEvent::Subscribe { notices, current } => {
                self.registrants.add(notices);
                let _ = current.send(self.snapshot());
            }
            RecoveryEvent::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            RecoveryEvent::Shutdown => {}
        }
    }

    /// Fire every timer that is due. Returns how many fired.
    pub fn fire_due_timers(&mut self) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.timers.pop_due(self.clock.now()) {
            match timer {
                RecoveryTimer::NetworkCheck => self.on_network_check(),
            }
            fired += 1;
        }
        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn stall(&self) -> &StallState {
        &self.stall
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    pub fn snapshot(&self) -> RecoverySnapshot {
        RecoverySnapshot {
            slot: self.slot,
            valid_network: self.stall.is_valid_network,
            recovery_triggered: self.stall.recovery_triggered,
            current_action: self.stall.current_action,
            last_action: self.stall.last_action,
            attempted_all_steps: self.stall.attempted_all_steps,
            stall_duration_ms: (!self.stall.is_valid_network)
                .then(|| self.stall_duration_ms(self.clock.now())),
            stats: self.stats.clone(),
        }
    }

    // ─── Validation ──────────────────────────────────────────────────────

    fn on_validation_status(&mut self, valid: bool) {
        let now = self.clock.now();
        let first_recorded = self.record_first_validation(valid, now);

        if valid {
            if self.stall.recovery_triggered {
                let reason = self.stall.recovered_reason(true);
                let duration_ms = self.stall_duration_ms(now);
                info!(
                    reason = reason.as_str(),
                    duration_ms,
                    last_action = %self.stall.last_action,
                    "data stall recovered"
                );
                self.stats.record_recovery(reason);
                self.registrants
                    .notify(&RecoveryNotice::Recovered { reason, duration_ms });
                if !first_recorded {
                    self.emit_record(self.stall.last_action, true, reason, false, now);
                }
            }
            self.reset();
            return;
        }

        if self.stall.is_valid_network {
            self.stall.data_stall_start = Some(now);
        }
        match self.is_recovery_needed(true, now) {
            Ok(()) => {
                if self.stall.is_valid_network {
                    self.stats.episodes += 1;
                    info!(slot = ?self.slot, "data stall detected");
                }
                self.stall.is_valid_network = false;
                self.do_recovery(now);
            }
            Err(reason) => {
                self.stats.suppressed += 1;
                debug!(reason = reason.as_str(), "data stall recovery skipped");
            }
        }
    }

    /// The first verdict after a rung ran gets its own record. Returns
    /// whether one was emitted.
    fn record_first_validation(&mut self, valid: bool, now: Instant) -> bool {
        if !std::mem::take(&mut self.stall.first_validation_pending) {
            return false;
        }
        let reason = self.stall.recovered_reason(valid);
        self.emit_record(self.stall.last_action, valid, reason, true, now);
        true
    }

    /// Preconditions for running the current rung. `check_back_off` is false
    /// when the check timer itself is the trigger.
    fn is_recovery_needed(&self, check_back_off: bool, now: Instant) -> Result<(), SkipReason> {
        if !self.stall.is_valid_network && !self.stall.recovery_started() {
            return Err(SkipReason::NotStalled);
        }
        if self.stall.attempted_all_steps {
            return Err(SkipReason::AllStepsAttempted);
        }
        if check_back_off
            && let Some(last) = self.stall.last_recovery_at
            && now.saturating_duration_since(last) < self.config.delay(self.stall.last_action)
        {
            return Err(SkipReason::BackOff);
        }
        let Some(slot) = self.slot else {
            return Err(SkipReason::NoPreferredSlot);
        };
        if self.collab.calls.active_call_slot().is_some()
            && self.stall.current_action > RecoveryAction::Cleanup
        {
            return Err(SkipReason::VoiceCall);
        }
        if !self.collab.signal.signal_level(slot).is_above_poor() {
            return Err(SkipReason::PoorSignal);
        }
        if !self.internet_connected {
            return Err(SkipReason::NotConnected);
        }
        if !self.collab.data_network.is_internet_data_allowed(slot) {
            return Err(SkipReason::DataNotAllowed);
        }
        Ok(())
    }

    // ─── Ladder ──────────────────────────────────────────────────────────

    fn do_recovery(&mut self, now: Instant) {
        let Some(slot) = self.slot else {
            return;
        };
        let action = self.stall.current_action;
        self.stall.recovery_triggered = true;
        self.stall.last_action = action;
        self.stall.last_recovery_at = Some(now);
        self.stall.first_validation_pending = true;
        self.stats.record_action(action);

        info!(%slot, %action, "executing data stall recovery action");
        self.registrants
            .notify(&RecoveryNotice::StallDetected { slot, action });
        self.emit_record(action, false, RecoveredReason::None, false, now);

        match action {
            RecoveryAction::GetDataCallList => {
                self.collab.radio.query_data_call_list(slot);
                self.set_action(RecoveryAction::Cleanup);
            }
            RecoveryAction::Cleanup => {
                if let Err(e) = self.arbiter.send(ArbiterEvent::ReestablishInternet { slot }) {
                    warn!(%slot, "arbiter gone, cannot rebuild internet: {e}");
                }
                self.set_action(RecoveryAction::RadioRestart);
            }
            RecoveryAction::RadioRestart => {
                self.collab.radio.power_cycle(slot);
                self.set_action(RecoveryAction::ResetModem);
            }
            RecoveryAction::ResetModem => {
                self.collab.radio.reset_modem(slot);
                self.reset_action();
                self.stall.attempted_all_steps = true;
                self.stats.exhausted += 1;
                warn!(%slot, "all data stall recovery actions attempted");
                self.registrants.notify(&RecoveryNotice::AllStepsAttempted);
            }
        }

        self.timers.cancel(&RecoveryTimer::NetworkCheck);
        if action != RecoveryAction::ResetModem {
            self.timers.schedule(
                RecoveryTimer::NetworkCheck,
                now + self.config.delay(action),
            );
        }
    }

    /// Pick the next rung, applying the side-signal short-circuits and
    /// configured skips.
    fn set_action(&mut self, action: RecoveryAction) {
        let mut action = action;
        // A skipped terminal rung wraps once; the config guarantees at least
        // one rung runs.
        for _ in 0..RecoveryAction::LADDER.len() * 2 {
            if self.stall.mobile_data_reenabled && action < RecoveryAction::RadioRestart {
                action = RecoveryAction::RadioRestart;
            }
            if self.stall.radio_state_changed && self.radio_power == RadioPowerState::On {
                action = RecoveryAction::ResetModem;
            }
            if !self.config.skips(action) {
                break;
            }
            debug!(%action, "recovery action skipped by configuration");
            match action.next() {
                Some(next) => action = next,
                None => {
                    self.stall.clear_side_signals();
                    self.stall.last_recovery_at = None;
                    action = RecoveryAction::GetDataCallList;
                }
            }
        }
        self.stall.current_action = action;
    }

    fn reset_action(&mut self) {
        self.stall.last_recovery_at = None;
        self.stall.clear_side_signals();
        self.set_action(RecoveryAction::GetDataCallList);
    }

    fn on_network_check(&mut self) {
        if self.stall.is_valid_network {
            return;
        }
        let now = self.clock.now();
        match self.is_recovery_needed(false, now) {
            Ok(()) => self.do_recovery(now),
            Err(reason) if reason.is_transient() => {
                self.stats.suppressed += 1;
                debug!(
                    reason = reason.as_str(),
                    "network check deferred, preconditions not met"
                );
                self.timers.schedule(
                    RecoveryTimer::NetworkCheck,
                    now + self.config.delay(self.stall.last_action),
                );
            }
            Err(reason) => {
                debug!(reason = reason.as_str(), "network check stops");
            }
        }
    }

    /// Back to NORMAL: fresh stall state, no pending check.
    fn reset(&mut self) {
        self.stall = StallState::default();
        self.set_action(RecoveryAction::GetDataCallList);
        self.timers.cancel(&RecoveryTimer::NetworkCheck);
    }

    // ─── Side signals ────────────────────────────────────────────────────

    fn on_preferred_data_changed(&mut self, state: PreferredDataState) {
        if state.preferred_slot == self.slot {
            return;
        }
        if self.stall.in_stall() {
            info!(
                from = ?self.slot,
                to = ?state.preferred_slot,
                "preferred slot moved during data stall, restarting recovery"
            );
            self.reset();
        }
        self.slot = state.preferred_slot;
    }

    fn on_radio_power_changed(&mut self, power: RadioPowerState) {
        if power == self.radio_power {
            return;
        }
        debug!(?power, "radio power changed");
        self.radio_power = power;
        if self.stall.in_stall() {
            self.stall.radio_state_changed = true;
            if power == RadioPowerState::On {
                self.set_action(self.stall.current_action);
            }
        }
    }

    fn on_mobile_data_enabled_changed(&mut self, enabled: bool) {
        if enabled == self.mobile_data_enabled {
            return;
        }
        debug!(enabled, "mobile data setting changed");
        self.mobile_data_enabled = enabled;
        if enabled && self.stall.in_stall() {
            debug!("mobile data re-enabled during data stall");
            self.stall.mobile_data_reenabled = true;
            self.set_action(self.stall.current_action);
        }
    }

    // ─── Telemetry ───────────────────────────────────────────────────────

    fn stall_duration_ms(&self, now: Instant) -> u64 {
        self.stall
            .data_stall_start
            .map(|start| now.saturating_duration_since(start).as_millis() as u64)
            .unwrap_or(0)
    }

    fn emit_record(
        &mut self,
        action: RecoveryAction,
        recovered: bool,
        reason: RecoveredReason,
        first_validation_after_recovery: bool,
        now: Instant,
    ) {
        let record = StallRecord {
            action,
            recovered,
            duration_ms: self.stall_duration_ms(now),
            reason,
            first_validation_after_recovery,
            recorded_at: Utc::now(),
        };
        self.registrants.notify(&RecoveryNotice::Record(record));
    }
}
