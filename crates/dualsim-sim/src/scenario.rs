//! TOML scenario scripts.
//!
//! A script names a device layout, an optional daemon config and a list of
//! steps. Steps either poke the device (registration, signal, calls, SIM
//! swaps, validation verdicts, time) or check it (`op = "expect"`). The
//! single-preferred-slot invariants are checked after every step as well.
//!
//! ```toml
//! name = "primary loses service"
//!
//! [config.auto_switch]
//! stability_threshold_ms = 500
//!
//! [[step]]
//! op = "registration"
//! slot = 0
//! state = "searching"
//!
//! [[step]]
//! op = "advance"
//! ms = 500
//!
//! [[step]]
//! op = "expect"
//! preferred_slot = 1
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use crossbeam_channel::Receiver;
use dualsim_common::models::{
    Capability, ImsRegistrationTech, NetworkRequest, PreferredDataState, RadioPowerState,
    RegistrationState, SignalLevel, SwitchReason, ValidationOutcome,
};
use dualsim_common::protocol::RecoveryNotice;
use dualsim_common::recovery::{RecoveredReason, RecoveryAction};
use dualsim_common::{SlotId, SubId};
use dualsim_core::arbiter::ArbiterEvent;
use dualsim_core::config::DaemonConfigInput;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::device::{DeviceSetup, SimDevice};
use crate::events::{self, DeviceEvent};

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioScript {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub device: DeviceSetup,
    #[serde(default)]
    pub config: DaemonConfigInput,
    /// Answer every validation the arbiter starts with this outcome.
    /// Unset leaves validations in flight until a `complete_validation` step.
    #[serde(default)]
    pub validator: Option<ValidationOutcome>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Registration {
        slot: usize,
        state: RegistrationState,
    },
    Signal {
        slot: usize,
        level: SignalLevel,
    },
    /// Network validation verdict for the Internet path.
    Validation { valid: bool },
    Advance { ms: u64 },
    InsertSim { slot: usize, sub: i32 },
    RemoveSim { slot: usize },
    DefaultData { sub: Option<i32> },
    Request {
        #[serde(default = "internet_only")]
        capabilities: Vec<Capability>,
        target: Option<i32>,
        #[serde(default)]
        remove: bool,
    },
    CallStarted {
        slot: usize,
        #[serde(default)]
        ims: ImsRegistrationTech,
    },
    CallEnded,
    EmergencyOverride {
        slot: usize,
        #[serde(default = "default_after_call_ms")]
        after_call_ms: u64,
        #[serde(default = "yes")]
        pending_call: bool,
        /// Expected completion, checked right after the request is handled.
        expect: Option<bool>,
    },
    MobileData { sub: i32, enabled: bool },
    DataDuringCall { sub: i32, enabled: bool },
    AirplaneMode { on: bool },
    RadioPower { state: RadioPowerState },
    /// Deliver an outcome for the validation in flight.
    CompleteValidation { outcome: ValidationOutcome },
    Expect(Expectation),
}

fn internet_only() -> Vec<Capability> {
    vec![Capability::Internet]
}

fn default_after_call_ms() -> u64 {
    5_000
}

fn yes() -> bool {
    true
}

impl Step {
    pub fn label(&self) -> &'static str {
        match self {
            Step::Registration { .. } => "registration",
            Step::Signal { .. } => "signal",
            Step::Validation { .. } => "validation",
            Step::Advance { .. } => "advance",
            Step::InsertSim { .. } => "insert_sim",
            Step::RemoveSim { .. } => "remove_sim",
            Step::DefaultData { .. } => "default_data",
            Step::Request { .. } => "request",
            Step::CallStarted { .. } => "call_started",
            Step::CallEnded => "call_ended",
            Step::EmergencyOverride { .. } => "emergency_override",
            Step::MobileData { .. } => "mobile_data",
            Step::DataDuringCall { .. } => "data_during_call",
            Step::AirplaneMode { .. } => "airplane_mode",
            Step::RadioPower { .. } => "radio_power",
            Step::CompleteValidation { .. } => "complete_validation",
            Step::Expect(_) => "expect",
        }
    }
}

/// Unset fields are not checked.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Expectation {
    pub preferred_slot: Option<usize>,
    pub preferred_sub: Option<i32>,
    /// `true` asserts the preferred subscription is empty.
    pub no_preferred_sub: Option<bool>,
    pub auto_selected_sub: Option<i32>,
    pub switch_reason: Option<SwitchReason>,
    pub emergency_slot: Option<usize>,
    pub valid_network: Option<bool>,
    pub current_action: Option<RecoveryAction>,
    pub attempted_all_steps: Option<bool>,
    /// Rungs executed since the previous `expect`.
    pub executed: Option<Vec<RecoveryAction>>,
    /// Reason of the last recovery since the previous `expect`.
    pub recovered: Option<RecoveredReason>,
    /// Total Internet rebuilds requested from the data network.
    pub rebuilds: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: usize,
    pub elapsed_ms: u64,
    pub preferred: PreferredDataState,
    pub executed: Vec<RecoveryAction>,
    pub preferred_changes: u64,
}

impl ScenarioScript {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        toml::from_str(input).map_err(|e| format!("Invalid scenario TOML: {}", e))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        Self::from_toml_str(&text).map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))
    }

    /// Run every step, stopping at the first failed expectation or broken
    /// invariant.
    pub fn run(&self) -> anyhow::Result<ScenarioReport> {
        let config = self
            .config
            .clone()
            .resolve()
            .map_err(|e| anyhow::anyhow!("scenario {:?}: {}", self.name, e))?;
        let device = self.device.build();
        device.validator.set_auto_outcome(self.validator);

        info!(name = %self.name, steps = self.steps.len(), "running scenario");
        let mut runner = Runner {
            sim: SimDevice::start(device, config),
            cursor: 0,
            executed: Vec::new(),
            overrides: Vec::new(),
        };
        runner
            .sim
            .check_invariants()
            .context("invariant broken at start")?;

        for (idx, step) in self.steps.iter().enumerate() {
            debug!(idx, op = step.label(), "step");
            runner
                .apply(step)
                .and_then(|()| runner.sim.check_invariants())
                .with_context(|| format!("{}: step {} ({})", self.name, idx + 1, step.label()))?;
        }

        runner.collect_actions();
        Ok(ScenarioReport {
            name: self.name.clone(),
            steps: self.steps.len(),
            elapsed_ms: runner.sim.elapsed().as_millis() as u64,
            preferred: runner.sim.arbiter.state(),
            executed: runner.executed,
            preferred_changes: runner.sim.arbiter.stats().preferred_changes,
        })
    }
}

struct Runner {
    sim: SimDevice,
    /// Recovery notices before this index were already inspected.
    cursor: usize,
    executed: Vec<RecoveryAction>,
    /// Override completions the script did not ask to check.
    overrides: Vec<Receiver<bool>>,
}

impl Runner {
    fn apply(&mut self, step: &Step) -> anyhow::Result<()> {
        let event = match step {
            Step::Registration { slot, state } => DeviceEvent::Registration(SlotId(*slot), *state),
            Step::Signal { slot, level } => DeviceEvent::Signal(SlotId(*slot), *level),
            Step::Validation { valid } => DeviceEvent::Validation(*valid),
            Step::Advance { ms } => DeviceEvent::Advance(Duration::from_millis(*ms)),
            Step::InsertSim { slot, sub } => DeviceEvent::InsertSim(SlotId(*slot), SubId(*sub)),
            Step::RemoveSim { slot } => DeviceEvent::RemoveSim(SlotId(*slot)),
            Step::DefaultData { sub } => DeviceEvent::DefaultData(sub.map(SubId)),
            Step::CallStarted { slot, ims } => DeviceEvent::CallStarted(SlotId(*slot), *ims),
            Step::CallEnded => DeviceEvent::CallEnded,
            Step::EmergencyOverride {
                slot,
                after_call_ms,
                pending_call,
                expect,
            } => {
                let done = events::apply(
                    &mut self.sim,
                    DeviceEvent::EmergencyOverride {
                        slot: SlotId(*slot),
                        after_call: Duration::from_millis(*after_call_ms),
                        pending_call: *pending_call,
                    },
                );
                let Some(done) = done else {
                    anyhow::bail!("override produced no completion");
                };
                match expect {
                    Some(want) => {
                        let got = done
                            .try_recv()
                            .map_err(|_| anyhow::anyhow!("override completion still pending"))?;
                        if got != *want {
                            anyhow::bail!("override completed {}, expected {}", got, want);
                        }
                    }
                    None => self.overrides.push(done),
                }
                return Ok(());
            }
            Step::MobileData { sub, enabled } => DeviceEvent::MobileData(SubId(*sub), *enabled),
            Step::DataDuringCall { sub, enabled } => {
                DeviceEvent::DataDuringCall(SubId(*sub), *enabled)
            }
            Step::AirplaneMode { on } => DeviceEvent::Airplane(*on),
            Step::RadioPower { state } => DeviceEvent::RadioPower(*state),
            Step::Request {
                capabilities,
                target,
                remove,
            } => {
                let request = NetworkRequest::new(capabilities.iter().copied(), target.map(SubId));
                self.sim.arbiter_event(if *remove {
                    ArbiterEvent::RequestRemoved(request)
                } else {
                    ArbiterEvent::RequestAdded(request)
                });
                return Ok(());
            }
            Step::CompleteValidation { outcome } => {
                if self.sim.device.validator.complete(*outcome).is_none() {
                    anyhow::bail!("no validation in flight");
                }
                self.sim.pump();
                return Ok(());
            }
            Step::Expect(expect) => return self.check(expect),
        };
        events::apply(&mut self.sim, event);
        Ok(())
    }

    /// Fold recovery notices past the cursor into the executed list and
    /// return the slice's rungs and last recovery reason.
    fn collect_actions(&mut self) -> (Vec<RecoveryAction>, Option<RecoveredReason>) {
        let mut actions = Vec::new();
        let mut recovered = None;
        for notice in &self.sim.recovery_log[self.cursor..] {
            match notice {
                RecoveryNotice::StallDetected { action, .. } => actions.push(*action),
                RecoveryNotice::Recovered { reason, .. } => recovered = Some(*reason),
                _ => {}
            }
        }
        self.cursor = self.sim.recovery_log.len();
        self.executed.extend_from_slice(&actions);
        (actions, recovered)
    }

    fn check(&mut self, expect: &Expectation) -> anyhow::Result<()> {
        let (actions, recovered) = self.collect_actions();
        let state = self.sim.arbiter.state();
        let snap = self.sim.arbiter.snapshot();
        let stall = self.sim.recovery.stall().clone();

        if let Some(slot) = expect.preferred_slot {
            check_eq("preferred_slot", Some(SlotId(slot)), state.preferred_slot)?;
        }
        if let Some(sub) = expect.preferred_sub {
            check_eq("preferred_sub", Some(SubId(sub)), state.preferred_sub)?;
        }
        if expect.no_preferred_sub == Some(true) && state.preferred_sub.is_some() {
            anyhow::bail!("preferred_sub: expected none, got {:?}", state.preferred_sub);
        }
        if let Some(sub) = expect.auto_selected_sub {
            check_eq("auto_selected_sub", Some(SubId(sub)), state.auto_selected_sub)?;
        }
        if let Some(reason) = expect.switch_reason {
            check_eq("switch_reason", reason, state.last_switch_reason)?;
        }
        if let Some(slot) = expect.emergency_slot {
            check_eq("emergency_slot", Some(SlotId(slot)), snap.emergency_slot)?;
        }
        if let Some(valid) = expect.valid_network {
            check_eq("valid_network", valid, stall.is_valid_network)?;
        }
        if let Some(action) = expect.current_action {
            check_eq("current_action", action, stall.current_action)?;
        }
        if let Some(all) = expect.attempted_all_steps {
            check_eq("attempted_all_steps", all, stall.attempted_all_steps)?;
        }
        if let Some(want) = &expect.executed {
            check_eq("executed", want.as_slice(), actions.as_slice())?;
        }
        if let Some(reason) = expect.recovered {
            check_eq("recovered", Some(reason), recovered)?;
        }
        if let Some(n) = expect.rebuilds {
            check_eq("rebuilds", n, self.sim.device.data_network.rebuilds().len())?;
        }
        Ok(())
    }
}

fn check_eq<T: PartialEq + std::fmt::Debug>(what: &str, want: T, got: T) -> anyhow::Result<()> {
    if want != got {
        anyhow::bail!("{}: expected {:?}, got {:?}", what, want, got);
    }
    Ok(())
}
