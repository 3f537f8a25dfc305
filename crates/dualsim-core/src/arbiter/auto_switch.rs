//! Automatic and opportunistic data switching.
//!
//! Auto switch moves data off a primary that has lost home service onto a
//! secondary that has it, and back once an exit condition holds. Every move
//! waits out a stability window and, where configured, a validation of the
//! target before it commits. Opportunistic data is the caller-driven
//! variant: validate a given subscription, then make it the data carrier.
//!
//! Both share the one in-flight validation slot; starting a validation
//! always stops the previous one.

use std::time::Duration;

use crossbeam_channel::Sender;
use dualsim_common::SubId;
use dualsim_common::error::OpportunisticError;
use dualsim_common::models::{SwitchReason, Transport, ValidationOutcome};
use tracing::{debug, info, warn};

use super::{ArbiterEvent, ArbiterTimer, EvalReason, PreferredDataArbiter};
use crate::collab::SettingKey;

#[derive(Debug, Default)]
pub(super) struct AutoSwitchState {
    /// Data currently sits on a secondary because of auto switch.
    pub engaged: bool,
    pub failures: u32,
    pub validation: Option<PendingValidation>,
    pub generation: u64,
    pub default_transport: Transport,
}

#[derive(Debug)]
pub(super) struct PendingValidation {
    pub sub: SubId,
    pub need_validation: bool,
    pub generation: u64,
    pub purpose: ValidationPurpose,
}

#[derive(Debug)]
pub(super) enum ValidationPurpose {
    /// `target = None` switches back to the primary.
    AutoSwitch { target: Option<SubId> },
    Opportunistic {
        reply: Sender<Result<(), OpportunisticError>>,
    },
}

impl PreferredDataArbiter {
    pub(super) fn evaluate_auto_switch(&mut self) {
        let Some(threshold) = self.auto_config.stability_threshold else {
            return;
        };
        if self.active_sub_count() <= 1 {
            self.cancel_pending_auto_switch();
            return;
        }
        let Some(primary) = self.state.primary_sub else {
            return;
        };
        let Some(primary_slot) = self.slot_of_active(primary) else {
            return;
        };
        let primary_home = self.phones.registration(primary_slot).is_home();

        if !self.auto.engaged {
            // An opportunistic subscription owns data; leave it alone.
            if self.state.auto_selected_sub.is_some() {
                return;
            }
            if primary_home {
                self.cancel_pending_auto_switch();
                return;
            }
            match self.auto_switch_candidate(primary) {
                Some(candidate) => {
                    let need_validation = self.auto_config.require_ping_test;
                    self.start_stability_check(Some(candidate), need_validation, threshold);
                }
                None => self.cancel_pending_auto_switch(),
            }
            return;
        }

        let settings = &self.collab.settings;
        let secondary = self
            .state
            .auto_selected_sub
            .filter(|s| self.collab.subscriptions.is_subscription_active(*s));
        let data_on = settings.get_or_default(SettingKey::UserDataEnabled(primary))
            && secondary.is_some_and(|s| settings.get_or_default(SettingKey::UserDataEnabled(s)));
        if !data_on {
            info!(?secondary, "data disabled on a switched slot, returning to primary");
            self.cancel_pending_auto_switch();
            self.commit_auto_switch(None);
            return;
        }
        if self.auto.default_transport != Transport::Cellular {
            self.start_stability_check(None, false, threshold);
            return;
        }
        if primary_home {
            let need_validation = self.auto_config.require_ping_test;
            self.start_stability_check(None, need_validation, threshold);
            return;
        }
        self.cancel_pending_auto_switch();
    }

    /// A secondary in home service whose owner opted in, while data is on
    /// for the primary.
    fn auto_switch_candidate(&self, primary: SubId) -> Option<SubId> {
        let settings = &self.collab.settings;
        if !settings.get_or_default(SettingKey::UserDataEnabled(primary)) {
            return None;
        }
        self.slot_subs.iter().enumerate().find_map(|(idx, sub)| {
            let sub = (*sub)?;
            let slot = dualsim_common::SlotId(idx);
            let eligible = sub != primary
                && self.collab.subscriptions.is_subscription_active(sub)
                && self.phones.registration(slot).is_home()
                && settings.get_or_default(SettingKey::AutoDataSwitch(sub))
                && self.collab.data_network.is_internet_data_allowed(slot);
            eligible.then_some(sub)
        })
    }

    fn active_sub_count(&self) -> usize {
        self.slot_subs
            .iter()
            .flatten()
            .filter(|s| self.collab.subscriptions.is_subscription_active(**s))
            .count()
    }

    fn start_stability_check(
        &mut self,
        target: Option<SubId>,
        need_validation: bool,
        threshold: Duration,
    ) {
        let key = ArbiterTimer::AutoSwitchStability {
            target,
            need_validation,
        };
        if self.timers.contains(&key) {
            return;
        }
        let validating_same = matches!(
            &self.auto.validation,
            Some(PendingValidation { purpose: ValidationPurpose::AutoSwitch { target: t }, .. }) if *t == target
        );
        if validating_same {
            return;
        }
        self.timers
            .cancel_where(|t| matches!(t, ArbiterTimer::AutoSwitchStability { .. }));
        debug!(?target, need_validation, ?threshold, "auto switch stability window started");
        self.timers.schedule(key, self.clock.now() + threshold);
    }

    pub(super) fn on_stability_elapsed(&mut self, target: Option<SubId>, need_validation: bool) {
        let Some(sub) = target.or(self.state.primary_sub) else {
            return;
        };
        info!(%sub, back_to_primary = target.is_none(), need_validation, "stability window elapsed, validating");
        self.start_validation(sub, need_validation, ValidationPurpose::AutoSwitch { target });
    }

    fn start_validation(&mut self, sub: SubId, need_validation: bool, purpose: ValidationPurpose) {
        if let Some(previous) = self.auto.validation.take() {
            self.collab.validator.stop_validation();
            if let ValidationPurpose::Opportunistic { reply } = previous.purpose {
                let _ = reply.send(Err(OpportunisticError::Replaced));
            }
        }
        self.auto.generation += 1;
        let generation = self.auto.generation;
        self.stats.validations_started += 1;
        self.auto.validation = Some(PendingValidation {
            sub,
            need_validation,
            generation,
            purpose,
        });

        let tx = self.mailbox.clone();
        self.collab.validator.validate(
            sub,
            self.auto_config.validation_timeout,
            need_validation,
            Box::new(move |sub, outcome| {
                let _ = tx.send(ArbiterEvent::ValidationResult {
                    sub,
                    outcome,
                    generation,
                });
            }),
        );
    }

    pub(super) fn on_validation_result(
        &mut self,
        sub: SubId,
        outcome: ValidationOutcome,
        generation: u64,
    ) {
        let Some(pending) = self
            .auto
            .validation
            .take_if(|p| p.generation == generation)
        else {
            debug!(%sub, generation, "ignoring stale validation result");
            return;
        };
        let passed = match outcome {
            ValidationOutcome::Passed => true,
            ValidationOutcome::NetworkAvailable => !pending.need_validation,
            ValidationOutcome::Failed => false,
        };
        debug!(sub = %pending.sub, ?outcome, passed, "validation finished");

        match pending.purpose {
            ValidationPurpose::AutoSwitch { target } => {
                if passed {
                    self.auto.failures = 0;
                    self.commit_auto_switch(target);
                } else {
                    self.schedule_auto_switch_retry();
                }
            }
            ValidationPurpose::Opportunistic { reply } => {
                if passed {
                    info!(sub = %pending.sub, "opportunistic data subscription selected");
                    self.state.auto_selected_sub = Some(pending.sub);
                    self.state.last_switch_reason = SwitchReason::Cbrs;
                    self.auto.engaged = false;
                    self.evaluate(EvalReason::Opportunistic);
                    let _ = reply.send(Ok(()));
                } else {
                    warn!(sub = %pending.sub, "opportunistic data validation failed");
                    let _ = reply.send(Err(OpportunisticError::ValidationFailed(pending.sub)));
                }
            }
        }
    }

    fn schedule_auto_switch_retry(&mut self) {
        let failures = self.auto.failures;
        if failures >= self.auto_config.max_retries {
            warn!(failures, "auto switch validation kept failing, giving up until next trigger");
            self.auto.failures = 0;
            return;
        }
        let delay = self
            .auto_config
            .retry_interval
            .saturating_mul(1u32 << failures.min(31));
        self.auto.failures = failures + 1;
        debug!(attempt = failures + 1, ?delay, "auto switch validation failed, retrying");
        self.timers.cancel(&ArbiterTimer::AutoSwitchRetry);
        self.timers
            .schedule(ArbiterTimer::AutoSwitchRetry, self.clock.now() + delay);
    }

    fn commit_auto_switch(&mut self, target: Option<SubId>) {
        info!(from = ?self.state.auto_selected_sub, to = ?target, "auto data switch");
        self.state.auto_selected_sub = target;
        self.state.last_switch_reason = SwitchReason::Auto;
        self.auto.engaged = target.is_some();
        self.stats.auto_switches += 1;
        self.evaluate(EvalReason::AutoSwitch);
    }

    /// Drop a pending stability window or auto-switch validation. The
    /// failure count starts over.
    pub(super) fn cancel_pending_auto_switch(&mut self) {
        let timers = self
            .timers
            .cancel_where(|t| matches!(t, ArbiterTimer::AutoSwitchStability { .. }));
        let validating = self
            .auto
            .validation
            .take_if(|p| matches!(p.purpose, ValidationPurpose::AutoSwitch { .. }))
            .is_some();
        if validating {
            self.collab.validator.stop_validation();
        }
        if timers > 0 || validating {
            debug!("pending auto data switch cancelled");
        }
        self.auto.failures = 0;
    }

    pub(super) fn set_opportunistic_data(
        &mut self,
        sub: Option<SubId>,
        need_validation: bool,
        reply: Sender<Result<(), OpportunisticError>>,
    ) {
        // Selecting the primary is the same as clearing.
        let sub = sub.filter(|s| Some(*s) != self.state.primary_sub);
        match sub {
            None => {
                if let Some(previous) = self
                    .auto
                    .validation
                    .take_if(|p| matches!(p.purpose, ValidationPurpose::Opportunistic { .. }))
                {
                    self.collab.validator.stop_validation();
                    if let ValidationPurpose::Opportunistic { reply } = previous.purpose {
                        let _ = reply.send(Err(OpportunisticError::Replaced));
                    }
                }
                if self.state.auto_selected_sub.is_some() {
                    info!("opportunistic data cleared, returning to primary");
                    self.state.auto_selected_sub = None;
                    self.state.last_switch_reason = SwitchReason::Cbrs;
                    self.auto.engaged = false;
                    self.evaluate(EvalReason::Opportunistic);
                }
                let _ = reply.send(Ok(()));
            }
            Some(sub) if !self.collab.subscriptions.is_subscription_active(sub) => {
                warn!(%sub, "opportunistic data requested for inactive subscription");
                let _ = reply.send(Err(OpportunisticError::InactiveSubscription(sub)));
            }
            Some(sub) if self.state.auto_selected_sub == Some(sub) && !self.auto.engaged => {
                let _ = reply.send(Ok(()));
            }
            Some(sub) => {
                self.cancel_pending_auto_switch();
                self.start_validation(sub, need_validation, ValidationPurpose::Opportunistic { reply });
            }
        }
    }
}
