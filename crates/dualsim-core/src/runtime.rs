//! # Actor Runtimes
//!
//! Each control loop owns one worker thread and one unbounded mailbox.
//! Everything that touches loop state, including modem acks and validation
//! results, arrives as a message, so the loop body never needs a lock. The
//! worker sleeps until the next timer deadline (or an idle ceiling),
//! handles whatever arrived, fires due timers, then publishes a snapshot
//! for telemetry.
//!
//! [`ControlPlane`] wires the two loops together: recovery follows the
//! arbiter's preferred slot through a bridge thread, and CLEANUP flows
//! back into the arbiter's mailbox.

use crate::arbiter::{ArbiterEvent, ArbiterSnapshot, EmergencyOverrideRequest, PreferredDataArbiter};
use crate::collab::Collaborators;
use crate::config::{ArbiterConfig, AutoSwitchConfig, DaemonConfig, RecoveryConfig};
use crate::metrics::{MetricsServer, TelemetryHandle, TelemetrySnapshot};
use crate::recovery::{DataStallRecoveryManager, RecoveryEvent, RecoverySnapshot};
use chrono::Utc;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use dualsim_common::error::OpportunisticError;
use dualsim_common::models::{NetworkRequest, PreferredDataState, RadioPowerState};
use dualsim_common::protocol::{ArbiterNotice, RecoveryNotice};
use dualsim_common::{SlotId, SubId};
use quanta::{Clock, Instant};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Longest sleep when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// How long a handle waits for a loop to answer a query.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// What the generic worker needs from a control loop.
trait ControlLoop: Send + 'static {
    type Event: Send + 'static;

    fn handle(&mut self, event: Self::Event);
    fn fire_due_timers(&mut self) -> usize;
    fn next_deadline(&self) -> Option<Instant>;
    fn is_shutdown(event: &Self::Event) -> bool;
    fn publish(&self, telemetry: &mut TelemetrySnapshot);
}

impl ControlLoop for PreferredDataArbiter {
    type Event = ArbiterEvent;

    fn handle(&mut self, event: ArbiterEvent) {
        PreferredDataArbiter::handle(self, event)
    }

    fn fire_due_timers(&mut self) -> usize {
        PreferredDataArbiter::fire_due_timers(self)
    }

    fn next_deadline(&self) -> Option<Instant> {
        PreferredDataArbiter::next_deadline(self)
    }

    fn is_shutdown(event: &ArbiterEvent) -> bool {
        matches!(event, ArbiterEvent::Shutdown)
    }

    fn publish(&self, telemetry: &mut TelemetrySnapshot) {
        telemetry.arbiter = Some(self.snapshot());
    }
}

impl ControlLoop for DataStallRecoveryManager {
    type Event = RecoveryEvent;

    fn handle(&mut self, event: RecoveryEvent) {
        DataStallRecoveryManager::handle(self, event)
    }

    fn fire_due_timers(&mut self) -> usize {
        DataStallRecoveryManager::fire_due_timers(self)
    }

    fn next_deadline(&self) -> Option<Instant> {
        DataStallRecoveryManager::next_deadline(self)
    }

    fn is_shutdown(event: &RecoveryEvent) -> bool {
        matches!(event, RecoveryEvent::Shutdown)
    }

    fn publish(&self, telemetry: &mut TelemetrySnapshot) {
        telemetry.recovery = Some(self.snapshot());
    }
}

fn run_loop<L: ControlLoop>(
    mut control: L,
    rx: Receiver<L::Event>,
    clock: Clock,
    telemetry: TelemetryHandle,
) {
    publish(&control, &telemetry);
    loop {
        let wait = control
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(clock.now()))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);
        match rx.recv_timeout(wait) {
            Ok(event) if L::is_shutdown(&event) => break,
            Ok(event) => control.handle(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        control.fire_due_timers();
        publish(&control, &telemetry);
    }
}

fn publish<L: ControlLoop>(control: &L, telemetry: &TelemetryHandle) {
    let mut t = telemetry.lock().unwrap_or_else(|e| e.into_inner());
    control.publish(&mut t);
    t.updated_at = Some(Utc::now());
}

fn join_worker(handle: &mut Option<thread::JoinHandle<()>>, name: &str) {
    if let Some(handle) = handle.take()
        && handle.join().is_err()
    {
        warn!(worker = name, "worker thread panicked");
    }
}

// ─── Arbiter ─────────────────────────────────────────────────────────────

/// Cloneable sender side of the arbiter's mailbox.
#[derive(Clone)]
pub struct ArbiterHandle {
    tx: Sender<ArbiterEvent>,
}

impl ArbiterHandle {
    pub fn send(&self, event: ArbiterEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("Arbiter mailbox closed: {}", e))
    }

    pub fn sender(&self) -> Sender<ArbiterEvent> {
        self.tx.clone()
    }

    pub fn add_request(&self, request: NetworkRequest) -> anyhow::Result<()> {
        self.send(ArbiterEvent::RequestAdded(request))
    }

    pub fn remove_request(&self, request: NetworkRequest) -> anyhow::Result<()> {
        self.send(ArbiterEvent::RequestRemoved(request))
    }

    /// Pin data to `slot` for an emergency call. The receiver yields
    /// whether the override took effect.
    pub fn request_emergency_override(
        &self,
        slot: SlotId,
        override_after_call_ends: Duration,
        pending_originating_call: bool,
    ) -> anyhow::Result<Receiver<bool>> {
        let (request, done) =
            EmergencyOverrideRequest::new(slot, override_after_call_ends, pending_originating_call);
        self.send(ArbiterEvent::EmergencyOverrideRequested(request))?;
        Ok(done)
    }

    /// Ask for data on an opportunistic subscription, or `None` to return
    /// to the primary.
    pub fn set_opportunistic_data(
        &self,
        sub: Option<SubId>,
        need_validation: bool,
    ) -> anyhow::Result<Receiver<Result<(), OpportunisticError>>> {
        let (reply, done) = bounded(1);
        self.send(ArbiterEvent::SetOpportunisticData {
            sub,
            need_validation,
            reply,
        })?;
        Ok(done)
    }

    /// Register for change notices. Returns the state at registration time
    /// and the receiver every later change lands on.
    pub fn subscribe(&self) -> anyhow::Result<(PreferredDataState, Receiver<ArbiterNotice>)> {
        let (notices, rx) = unbounded();
        let (current, current_rx) = bounded(1);
        self.send(ArbiterEvent::Subscribe { notices, current })?;
        let state = current_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Arbiter did not answer subscribe: {}", e))?;
        Ok((state, rx))
    }

    pub fn snapshot(&self) -> anyhow::Result<ArbiterSnapshot> {
        let (reply, rx) = bounded(1);
        self.send(ArbiterEvent::Snapshot(reply))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Arbiter did not answer snapshot: {}", e))
    }
}

/// Owns the arbiter worker thread. Dropping it shuts the worker down.
pub struct ArbiterRuntime {
    handle: ArbiterHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl ArbiterRuntime {
    pub fn spawn(
        config: ArbiterConfig,
        auto_config: AutoSwitchConfig,
        collab: Collaborators,
        clock: Clock,
        telemetry: TelemetryHandle,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded();
        let mailbox = tx.clone();
        let worker = thread::Builder::new()
            .name("dualsim-arbiter".into())
            .spawn(move || {
                let mut arbiter =
                    PreferredDataArbiter::new(config, auto_config, collab, clock.clone(), mailbox);
                arbiter.start();
                run_loop(arbiter, rx, clock, telemetry);
                debug!("arbiter worker exited");
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn arbiter worker: {}", e))?;
        Ok(Self {
            handle: ArbiterHandle { tx },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    /// Stop the worker and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        if self.worker.is_some() {
            let _ = self.handle.send(ArbiterEvent::Shutdown);
            join_worker(&mut self.worker, "arbiter");
        }
    }
}

impl Drop for ArbiterRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Recovery ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RecoveryHandle {
    tx: Sender<RecoveryEvent>,
}

impl RecoveryHandle {
    pub fn send(&self, event: RecoveryEvent) -> anyhow::Result<()> {
        self.tx
            .send(event)
            .map_err(|e| anyhow::anyhow!("Recovery mailbox closed: {}", e))
    }

    /// Report the validation verdict of the connected Internet network.
    pub fn report_validation(&self, valid: bool) -> anyhow::Result<()> {
        self.send(RecoveryEvent::ValidationStatus { valid })
    }

    pub fn subscribe(&self) -> anyhow::Result<(RecoverySnapshot, Receiver<RecoveryNotice>)> {
        let (notices, rx) = unbounded();
        let (current, current_rx) = bounded(1);
        self.send(RecoveryEvent::Subscribe { notices, current })?;
        let snapshot = current_rx
            .recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Recovery did not answer subscribe: {}", e))?;
        Ok((snapshot, rx))
    }

    pub fn snapshot(&self) -> anyhow::Result<RecoverySnapshot> {
        let (reply, rx) = bounded(1);
        self.send(RecoveryEvent::Snapshot(reply))?;
        rx.recv_timeout(REPLY_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Recovery did not answer snapshot: {}", e))
    }
}

/// Owns the recovery worker thread. Dropping it shuts the worker down.
pub struct RecoveryRuntime {
    handle: RecoveryHandle,
    worker: Option<thread::JoinHandle<()>>,
}

impl RecoveryRuntime {
    pub fn spawn(
        config: RecoveryConfig,
        collab: Collaborators,
        clock: Clock,
        arbiter: Sender<ArbiterEvent>,
        preferred: PreferredDataState,
        telemetry: TelemetryHandle,
    ) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("dualsim-recovery".into())
            .spawn(move || {
                let manager = DataStallRecoveryManager::new(
                    config,
                    collab,
                    clock.clone(),
                    arbiter,
                    preferred,
                );
                run_loop(manager, rx, clock, telemetry);
                debug!("recovery worker exited");
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn recovery worker: {}", e))?;
        Ok(Self {
            handle: RecoveryHandle { tx },
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> RecoveryHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        if self.worker.is_some() {
            let _ = self.handle.send(RecoveryEvent::Shutdown);
            join_worker(&mut self.worker, "recovery");
        }
    }
}

impl Drop for RecoveryRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─── Radio power ─────────────────────────────────────────────────────────

/// Feeds radio power changes to both loops: recovery watches the off/on
/// cycle, the arbiter re-issues its commands once the radio is back.
#[derive(Clone)]
pub struct RadioPowerReporter {
    arbiter: ArbiterHandle,
    recovery: RecoveryHandle,
}

impl RadioPowerReporter {
    pub fn report(&self, power: RadioPowerState) -> anyhow::Result<()> {
        self.recovery.send(RecoveryEvent::RadioPowerChanged(power))?;
        if power == RadioPowerState::On {
            self.arbiter.send(ArbiterEvent::RadioOn)?;
        }
        Ok(())
    }

    /// A completed power cycle reads as off, then on.
    pub fn power_cycled(&self) -> anyhow::Result<()> {
        self.report(RadioPowerState::Off)?;
        self.report(RadioPowerState::On)
    }
}

// ─── Control plane ───────────────────────────────────────────────────────

/// Both loops, the bridge between them and the optional metrics server.
pub struct ControlPlane {
    arbiter: ArbiterRuntime,
    recovery: RecoveryRuntime,
    bridge: Option<thread::JoinHandle<()>>,
    telemetry: TelemetryHandle,
    metrics_server: Option<MetricsServer>,
}

impl ControlPlane {
    pub fn start(config: &DaemonConfig, collab: Collaborators, clock: Clock) -> anyhow::Result<Self> {
        let telemetry: TelemetryHandle = Arc::new(Mutex::new(TelemetrySnapshot::default()));

        let arbiter = ArbiterRuntime::spawn(
            config.arbiter.clone(),
            config.auto_switch.clone(),
            collab.clone(),
            clock.clone(),
            telemetry.clone(),
        )?;
        let (preferred, notices) = arbiter.handle().subscribe()?;

        let recovery = RecoveryRuntime::spawn(
            config.recovery.clone(),
            collab,
            clock,
            arbiter.handle().sender(),
            preferred,
            telemetry.clone(),
        )?;

        let recovery_handle = recovery.handle();
        let bridge = thread::Builder::new()
            .name("dualsim-bridge".into())
            .spawn(move || {
                for notice in notices.iter() {
                    if let ArbiterNotice::PreferredDataChanged(state) = notice
                        && recovery_handle
                            .send(RecoveryEvent::PreferredDataChanged(state))
                            .is_err()
                    {
                        break;
                    }
                }
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn bridge: {}", e))?;

        let metrics_server = match config.telemetry.metrics_addr {
            Some(addr) => Some(MetricsServer::start(addr, telemetry.clone())?),
            None => None,
        };

        info!(
            preferred = ?preferred.preferred_slot,
            metrics = ?metrics_server.as_ref().map(|s| s.addr()),
            "control plane started"
        );
        Ok(Self {
            arbiter,
            recovery,
            bridge: Some(bridge),
            telemetry,
            metrics_server,
        })
    }

    pub fn arbiter(&self) -> ArbiterHandle {
        self.arbiter.handle()
    }

    pub fn recovery(&self) -> RecoveryHandle {
        self.recovery.handle()
    }

    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry.clone()
    }

    pub fn radio_power(&self) -> RadioPowerReporter {
        RadioPowerReporter {
            arbiter: self.arbiter(),
            recovery: self.recovery(),
        }
    }

    pub fn radio_power_changed(&self, power: RadioPowerState) -> anyhow::Result<()> {
        self.radio_power().report(power)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server.as_ref().map(|s| s.addr())
    }

    /// Stop everything in dependency order. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(mut server) = self.metrics_server.take() {
            server.stop();
        }
        // The bridge ends once the arbiter, which holds its sender, is gone.
        self.arbiter.shutdown();
        join_worker(&mut self.bridge, "bridge");
        self.recovery.shutdown();
    }
}

impl Drop for ControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::memory::{MemoryDevice, RadioCommand};
    use dualsim_common::recovery::RecoveryAction;

    fn device() -> MemoryDevice {
        let device = MemoryDevice::new(2);
        device.subscriptions.insert_sim(SlotId(0), SubId(1));
        device.subscriptions.insert_sim(SlotId(1), SubId(2));
        device.subscriptions.set_default_data(Some(SubId(1)));
        device
    }

    fn wait_for<T>(mut poll: impl FnMut() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(v) = poll() {
                return v;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn arbiter_runtime_starts_and_answers() {
        let device = device();
        let telemetry = Arc::new(Mutex::new(TelemetrySnapshot::default()));
        let mut rt = ArbiterRuntime::spawn(
            ArbiterConfig::default(),
            AutoSwitchConfig::default(),
            device.collaborators(),
            Clock::new(),
            telemetry.clone(),
        )
        .unwrap();

        let (state, _notices) = rt.handle().subscribe().unwrap();
        assert_eq!(state.preferred_slot, Some(SlotId(0)));
        let snap = rt.handle().snapshot().unwrap();
        assert!(snap.slots[0].active);
        assert!(telemetry.lock().unwrap().arbiter.is_some());

        rt.shutdown();
        rt.shutdown();
        assert!(rt.handle().send(ArbiterEvent::RadioOn).is_err());
    }

    #[test]
    fn primary_change_reaches_subscribers() {
        let device = device();
        let telemetry = Arc::new(Mutex::new(TelemetrySnapshot::default()));
        let rt = ArbiterRuntime::spawn(
            ArbiterConfig::default(),
            AutoSwitchConfig::default(),
            device.collaborators(),
            Clock::new(),
            telemetry,
        )
        .unwrap();
        let (_, notices) = rt.handle().subscribe().unwrap();

        device.subscriptions.set_default_data(Some(SubId(2)));
        rt.handle()
            .send(ArbiterEvent::SubscriptionMappingChanged)
            .unwrap();

        let state = wait_for(|| match notices.try_recv() {
            Ok(ArbiterNotice::PreferredDataChanged(s)) => Some(s),
            _ => None,
        });
        assert_eq!(state.preferred_slot, Some(SlotId(1)));
    }

    #[test]
    fn control_plane_cleanup_flows_back_to_arbiter() {
        let device = device();
        let config = DaemonConfig {
            recovery: RecoveryConfig::uniform(Duration::from_millis(20)),
            ..DaemonConfig::default()
        };
        let mut plane = ControlPlane::start(&config, device.collaborators(), Clock::new()).unwrap();
        let recovery = plane.recovery();
        let (_, notices) = recovery.subscribe().unwrap();
        recovery
            .send(RecoveryEvent::InternetNetworkChanged { connected: true })
            .unwrap();
        recovery.report_validation(false).unwrap();

        let action = wait_for(|| match notices.try_recv() {
            Ok(RecoveryNotice::StallDetected { action, .. })
                if action == RecoveryAction::Cleanup =>
            {
                Some(action)
            }
            _ => None,
        });
        assert_eq!(action, RecoveryAction::Cleanup);
        wait_for(|| (!device.data_network.rebuilds().is_empty()).then_some(()));
        assert_eq!(device.data_network.rebuilds()[0], SlotId(0));
        assert!(
            device
                .radio
                .commands()
                .contains(&RadioCommand::QueryDataCallList(SlotId(0)))
        );

        plane.shutdown();
    }

    #[test]
    fn control_plane_moves_recovery_with_preferred_slot() {
        let device = device();
        let mut plane =
            ControlPlane::start(&DaemonConfig::default(), device.collaborators(), Clock::new())
                .unwrap();
        device.subscriptions.set_default_data(Some(SubId(2)));
        plane
            .arbiter()
            .send(ArbiterEvent::SubscriptionMappingChanged)
            .unwrap();

        let recovery = plane.recovery();
        wait_for(|| {
            recovery
                .snapshot()
                .ok()
                .filter(|s| s.slot == Some(SlotId(1)))
        });
        plane.shutdown();
    }

    #[test]
    fn radio_restart_cycles_power_through_both_loops() {
        let device = device();
        let config = DaemonConfig {
            recovery: RecoveryConfig::uniform(Duration::from_millis(300))
                .with_skip(RecoveryAction::Cleanup, true)
                .unwrap(),
            ..DaemonConfig::default()
        };
        let mut plane = ControlPlane::start(&config, device.collaborators(), Clock::new()).unwrap();
        let reporter = plane.radio_power();
        device.radio.on_power_cycle(move |_| {
            reporter.power_cycled().unwrap();
        });
        let recovery = plane.recovery();
        recovery
            .send(RecoveryEvent::InternetNetworkChanged { connected: true })
            .unwrap();
        recovery.report_validation(false).unwrap();

        // Radio-on forces the arbiter to send its slot command again.
        wait_for(|| {
            let cmds = device.radio.commands();
            let cycled = cmds
                .iter()
                .position(|c| *c == RadioCommand::PowerCycle(SlotId(0)))?;
            cmds[cycled..]
                .contains(&RadioCommand::Activate(SlotId(0)))
                .then_some(())
        });
        let snap = recovery.snapshot().unwrap();
        assert_eq!(snap.last_action, RecoveryAction::RadioRestart);
        assert_eq!(snap.current_action, RecoveryAction::ResetModem);
        plane.shutdown();
    }

    #[test]
    fn radio_power_reaches_both_loops() {
        let device = device();
        let mut plane =
            ControlPlane::start(&DaemonConfig::default(), device.collaborators(), Clock::new())
                .unwrap();
        wait_for(|| (!device.radio.commands().is_empty()).then_some(()));
        let before = device.radio.commands().len();

        plane.radio_power_changed(RadioPowerState::Off).unwrap();
        plane.radio_power_changed(RadioPowerState::On).unwrap();
        wait_for(|| {
            device.radio.commands()[before..]
                .contains(&RadioCommand::Activate(SlotId(0)))
                .then_some(())
        });
        plane.shutdown();
        assert!(plane.radio_power_changed(RadioPowerState::On).is_err());
    }

    #[test]
    fn control_plane_serves_metrics() {
        let device = device();
        let mut config = DaemonConfig::default();
        config.telemetry.metrics_addr = Some("127.0.0.1:0".parse().unwrap());
        let mut plane = ControlPlane::start(&config, device.collaborators(), Clock::new()).unwrap();
        assert!(plane.metrics_addr().is_some());
        wait_for(|| {
            let t = plane.telemetry();
            let t = t.lock().unwrap();
            (t.arbiter.is_some() && t.recovery.is_some()).then_some(())
        });
        plane.shutdown();
        assert_eq!(plane.metrics_addr(), None);
    }
}
