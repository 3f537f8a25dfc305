//! Messages and timers of the arbiter loop.

use crossbeam_channel::Sender;
use dualsim_common::error::{CommandError, OpportunisticError};
use dualsim_common::models::{
    CommandMode, NetworkRequest, PreferredDataState, RegistrationState, Transport,
    ValidationOutcome,
};
use dualsim_common::protocol::ArbiterNotice;
use dualsim_common::{SlotId, SubId};
use serde::Serialize;

use super::emergency::EmergencyOverrideRequest;

/// Everything the arbiter reacts to. Processed strictly in arrival order.
pub enum ArbiterEvent {
    RequestAdded(NetworkRequest),
    RequestRemoved(NetworkRequest),
    SubscriptionMappingChanged,
    ServiceStateChanged(SlotId),
    VoiceCallStateChanged,
    EmergencyOverrideRequested(EmergencyOverrideRequest),
    ValidationResult {
        sub: SubId,
        outcome: ValidationOutcome,
        generation: u64,
    },
    RadioOn,
    SimLoaded(SlotId),
    ModemCountChanged(usize),
    DataSettingsChanged,
    DefaultNetworkChanged(Transport),
    SetOpportunisticData {
        sub: Option<SubId>,
        need_validation: bool,
        reply: Sender<Result<(), OpportunisticError>>,
    },
    /// Posted by the recovery manager's cleanup rung.
    ReestablishInternet { slot: SlotId },
    CommandDone {
        slot: SlotId,
        kind: CommandKind,
        token: u64,
        result: Result<(), CommandError>,
    },
    Subscribe {
        notices: Sender<ArbiterNotice>,
        current: Sender<PreferredDataState>,
    },
    Snapshot(Sender<ArbiterSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Activate,
    Deactivate,
    SetPreferred,
}

impl CommandKind {
    /// Whether an ack means data can now flow on the slot.
    pub fn enables_data(self) -> bool {
        !matches!(self, CommandKind::Deactivate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterTimer {
    /// Stability window for an auto switch. `target = None` means back to
    /// the primary subscription.
    AutoSwitchStability {
        target: Option<SubId>,
        need_validation: bool,
    },
    AutoSwitchRetry,
    CommandRetry(SlotId),
    EmergencyOverrideExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalReason {
    RequestsChanged,
    SubscriptionMapping,
    ServiceState,
    VoiceCall,
    EmergencyOverride,
    RadioOn,
    ModemCount,
    DataSettings,
    AutoSwitch,
    Opportunistic,
}

impl EvalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvalReason::RequestsChanged => "requests_changed",
            EvalReason::SubscriptionMapping => "subscription_mapping",
            EvalReason::ServiceState => "service_state",
            EvalReason::VoiceCall => "voice_call",
            EvalReason::EmergencyOverride => "emergency_override",
            EvalReason::RadioOn => "radio_on",
            EvalReason::ModemCount => "modem_count",
            EvalReason::DataSettings => "data_settings",
            EvalReason::AutoSwitch => "auto_switch",
            EvalReason::Opportunistic => "opportunistic",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub evaluations: u64,
    pub preferred_changes: u64,
    pub commands_sent: u64,
    pub command_failures: u64,
    pub auto_switches: u64,
    pub validations_started: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSnapshot {
    pub slot: SlotId,
    pub sub: Option<SubId>,
    pub requested_active: bool,
    pub active: bool,
    pub registration: RegistrationState,
}

/// Point-in-time view of the arbiter, for telemetry and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbiterSnapshot {
    pub mode: CommandMode,
    pub state: PreferredDataState,
    pub slots: Vec<SlotSnapshot>,
    pub slot_in_call: Option<SlotId>,
    pub emergency_slot: Option<SlotId>,
    pub auto_switch_engaged: bool,
    pub auto_switch_failures: u32,
    pub outstanding_requests: usize,
    pub stats: ArbiterStats,
}
