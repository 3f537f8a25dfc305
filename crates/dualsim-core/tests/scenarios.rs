//! End-to-end scenarios across both control loops.

mod support;

use std::time::Duration;

use dualsim_common::models::{RegistrationState, SignalLevel, SwitchReason, ValidationOutcome};
use dualsim_common::protocol::{ArbiterNotice, RecoveryNotice};
use dualsim_common::recovery::{RecoveredReason, RecoveryAction};
use dualsim_common::{SlotId, SubId};
use dualsim_core::arbiter::{ArbiterEvent, EmergencyOverrideRequest};
use dualsim_core::collab::SettingsStore;
use dualsim_core::collab::memory::RadioCommand;
use dualsim_core::collab::SettingKey;
use dualsim_core::config::{DaemonConfig, RecoveryConfig};
use dualsim_core::recovery::RecoveryEvent;
use support::{Bench, two_sims};

const RUNG_DELAY: Duration = Duration::from_secs(30);

fn config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.auto_switch.stability_threshold = Some(Duration::from_millis(500));
    config.recovery = RecoveryConfig::uniform(RUNG_DELAY);
    config
}

// ─── Auto data switch ────────────────────────────────────────────────────

#[test]
fn primary_losing_home_service_moves_data_after_stability_window() {
    let device = two_sims();
    device
        .subscriptions
        .set_registration(SlotId(1), RegistrationState::Searching);
    device
        .settings
        .set_bool(SettingKey::AutoDataSwitch(SubId(2)), true);
    device
        .validator
        .set_auto_outcome(Some(ValidationOutcome::Passed));
    let mut bench = Bench::start(device, config());
    assert_eq!(bench.preferred(), Some(SlotId(0)));

    bench.set_registration(0, RegistrationState::Searching);
    bench.set_registration(1, RegistrationState::Home);

    bench.advance(Duration::from_millis(499));
    assert_eq!(bench.preferred(), Some(SlotId(0)), "window not elapsed yet");

    bench.advance(Duration::from_millis(1));
    let state = bench.arbiter.state();
    assert_eq!(state.preferred_slot, Some(SlotId(1)));
    assert_eq!(state.auto_selected_sub, Some(SubId(2)));
    assert_eq!(state.last_switch_reason, SwitchReason::Auto);
    assert_eq!(bench.device.validator.requests(), vec![(SubId(2), true)]);

    // Recovery follows the data path.
    assert_eq!(bench.recovery.snapshot().slot, Some(SlotId(1)));
}

#[test]
fn auto_switch_returns_when_primary_recovers() {
    let device = two_sims();
    device
        .settings
        .set_bool(SettingKey::AutoDataSwitch(SubId(2)), true);
    device
        .validator
        .set_auto_outcome(Some(ValidationOutcome::Passed));
    let mut bench = Bench::start(device, config());

    bench.set_registration(0, RegistrationState::Searching);
    bench.advance(Duration::from_millis(500));
    assert_eq!(bench.preferred(), Some(SlotId(1)));

    bench.set_registration(0, RegistrationState::Home);
    bench.advance(Duration::from_millis(500));
    let state = bench.arbiter.state();
    assert_eq!(state.preferred_slot, Some(SlotId(0)));
    assert_eq!(state.auto_selected_sub, None);
}

// ─── Stall recovery ──────────────────────────────────────────────────────

#[test]
fn poor_signal_defers_stall_until_signal_improves() {
    let device = two_sims();
    device.signal.set_level(SlotId(0), SignalLevel::Poor);
    let mut bench = Bench::start(device, config());

    bench.validation(false);
    assert!(bench.take_actions().is_empty());
    assert!(bench.recovery.stall().is_valid_network);

    bench.device.signal.set_level(SlotId(0), SignalLevel::Moderate);
    bench.validation(false);
    assert_eq!(bench.take_actions(), vec![RecoveryAction::GetDataCallList]);
    assert!(!bench.recovery.stall().is_valid_network);
}

#[test]
fn mobile_data_reenabled_mid_stall_skips_cleanup() {
    let mut bench = Bench::start(two_sims(), config());
    bench.validation(false);
    assert_eq!(bench.take_actions(), vec![RecoveryAction::GetDataCallList]);
    assert_eq!(
        bench.recovery.stall().current_action,
        RecoveryAction::Cleanup
    );

    bench.recovery_event(RecoveryEvent::MobileDataEnabledChanged(false));
    bench.recovery_event(RecoveryEvent::MobileDataEnabledChanged(true));
    assert_eq!(
        bench.recovery.stall().current_action,
        RecoveryAction::RadioRestart
    );

    bench.advance(RUNG_DELAY);
    assert_eq!(bench.take_actions(), vec![RecoveryAction::RadioRestart]);
    assert!(bench.device.data_network.rebuilds().is_empty());
    assert!(
        bench
            .device
            .radio
            .commands()
            .contains(&RadioCommand::PowerCycle(SlotId(0)))
    );
}

#[test]
fn cleanup_rebuilds_through_the_arbiter() {
    let mut bench = Bench::start(two_sims(), config());
    bench.device.radio.take_commands();

    bench.validation(false);
    bench.advance(RUNG_DELAY);
    assert_eq!(
        bench.take_actions(),
        vec![RecoveryAction::GetDataCallList, RecoveryAction::Cleanup]
    );
    assert_eq!(bench.device.data_network.rebuilds(), vec![SlotId(0)]);
    assert!(
        bench
            .device
            .radio
            .commands()
            .contains(&RadioCommand::Activate(SlotId(0))),
        "slot command re-issued after rebuild"
    );
    assert_eq!(bench.preferred(), Some(SlotId(0)));
}

#[test]
fn exhausted_ladder_waits_for_validation() {
    let mut bench = Bench::start(two_sims(), config());
    bench.validation(false);
    for _ in 0..3 {
        bench.advance(RUNG_DELAY);
    }
    assert_eq!(bench.take_actions(), RecoveryAction::LADDER.to_vec());
    assert!(bench.recovery.stall().attempted_all_steps);

    bench.advance(RUNG_DELAY * 4);
    bench.validation(false);
    assert!(bench.take_actions().is_empty());

    bench.validation(true);
    assert!(!bench.recovery.stall().attempted_all_steps);
    assert!(bench.recovery_log.iter().any(|n| matches!(
        n,
        RecoveryNotice::Recovered {
            reason: RecoveredReason::Dsrm,
            ..
        }
    )));

    bench.validation(false);
    assert_eq!(bench.take_actions(), vec![RecoveryAction::GetDataCallList]);
}

#[test]
fn preferred_slot_change_restarts_recovery_on_new_slot() {
    let mut bench = Bench::start(two_sims(), config());
    bench.validation(false);
    assert_eq!(bench.take_actions(), vec![RecoveryAction::GetDataCallList]);

    bench.device.subscriptions.set_default_data(Some(SubId(2)));
    bench.arbiter_event(ArbiterEvent::SubscriptionMappingChanged);
    assert_eq!(bench.preferred(), Some(SlotId(1)));
    assert!(bench.recovery.stall().is_valid_network);

    bench.advance(RUNG_DELAY);
    assert!(bench.take_actions().is_empty(), "old check timer cancelled");

    bench.validation(false);
    assert!(bench.recovery_log.iter().any(|n| matches!(
        n,
        RecoveryNotice::StallDetected {
            slot: SlotId(1),
            action: RecoveryAction::GetDataCallList
        }
    )));
}

// ─── Emergency override ──────────────────────────────────────────────────

#[test]
fn emergency_override_pins_slot_and_rejects_conflicts() {
    let device = two_sims();
    device
        .subscriptions
        .set_registration(SlotId(1), RegistrationState::NotRegistered);
    let mut bench = Bench::start(device, config());
    assert_eq!(bench.preferred(), Some(SlotId(0)));

    let (first, first_done) =
        EmergencyOverrideRequest::new(SlotId(1), Duration::from_secs(5), true);
    bench.arbiter_event(ArbiterEvent::EmergencyOverrideRequested(first));
    assert_eq!(bench.preferred(), Some(SlotId(1)));
    assert_eq!(first_done.try_recv(), Ok(true));

    let (second, second_done) =
        EmergencyOverrideRequest::new(SlotId(0), Duration::from_secs(5), true);
    bench.arbiter_event(ArbiterEvent::EmergencyOverrideRequested(second));
    assert_eq!(second_done.try_recv(), Ok(false));
    assert_eq!(bench.preferred(), Some(SlotId(1)));

    assert!(bench.arbiter_log.iter().any(|n| matches!(
        n,
        ArbiterNotice::PreferredDataChanged(s) if s.preferred_slot == Some(SlotId(1))
    )));

    // The call never starts; the override lapses.
    bench.advance(Duration::from_secs(5));
    assert_eq!(bench.preferred(), Some(SlotId(0)));
}
