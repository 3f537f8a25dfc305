//! Data model shared by the arbiter, the stall recovery manager and their
//! collaborators.
//!
//! These are plain values: everything crossing an actor boundary is one of
//! these types (or a [`crate::protocol`] notice wrapping them).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::ids::{SlotId, SubId};

// ── Registration ────────────────────────────────────────────────────

/// Packet-service registration state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    #[default]
    NotRegistered,
    Home,
    Roaming,
    Searching,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::NotRegistered => "not_registered",
            RegistrationState::Home => "home",
            RegistrationState::Roaming => "roaming",
            RegistrationState::Searching => "searching",
        }
    }

    pub fn is_home(&self) -> bool {
        matches!(self, RegistrationState::Home)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RegistrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_registered" => Ok(RegistrationState::NotRegistered),
            "home" => Ok(RegistrationState::Home),
            "roaming" => Ok(RegistrationState::Roaming),
            "searching" => Ok(RegistrationState::Searching),
            other => Err(format!("unknown registration state: {other}")),
        }
    }
}

/// Coarse signal strength bucket reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalLevel {
    #[default]
    NoneOrUnknown,
    Poor,
    Moderate,
    Good,
    Great,
}

impl SignalLevel {
    /// Recovery is only attempted when the level is strictly above `Poor`.
    pub fn is_above_poor(self) -> bool {
        self > SignalLevel::Poor
    }
}

impl std::str::FromStr for SignalLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "none_or_unknown" => Ok(SignalLevel::NoneOrUnknown),
            "poor" => Ok(SignalLevel::Poor),
            "moderate" => Ok(SignalLevel::Moderate),
            "good" => Ok(SignalLevel::Good),
            "great" => Ok(SignalLevel::Great),
            other => Err(format!("unknown signal level: {other}")),
        }
    }
}

/// Technology an IMS voice registration runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImsRegistrationTech {
    #[default]
    None,
    Lte,
    Nr,
    /// Voice over Wi-Fi; the call does not depend on cellular data.
    Iwlan,
    /// Voice carried over the other SIM's data path.
    CrossSim,
}

impl ImsRegistrationTech {
    /// Whether a call on this technology survives data moving to another
    /// slot, in which case data should not follow the call.
    pub fn tolerates_data_handover(self) -> bool {
        matches!(self, ImsRegistrationTech::Iwlan | ImsRegistrationTech::CrossSim)
    }
}

/// Transport of the system default network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Cellular,
    Wifi,
    Ethernet,
}

/// Radio power state as reported by the modem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RadioPowerState {
    Off,
    #[default]
    On,
    Unavailable,
}

// ── Requests ────────────────────────────────────────────────────────

/// Capability a network request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Internet,
    Mms,
    Supl,
    Ims,
    Emergency,
    Enterprise,
}

/// A request for data connectivity, optionally pinned to one subscription.
///
/// Equality covers the whole value, so two requests with the same
/// capabilities and target are the same request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub capabilities: BTreeSet<Capability>,
    pub target: Option<SubId>,
}

impl NetworkRequest {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>, target: Option<SubId>) -> Self {
        Self {
            capabilities: capabilities.into_iter().collect(),
            target,
        }
    }

    /// Default Internet request following the preferred subscription.
    pub fn internet() -> Self {
        Self::new([Capability::Internet], None)
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// ── Preferred data ──────────────────────────────────────────────────

/// Why the preferred data subscription last changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchReason {
    #[default]
    Unknown,
    /// The user picked a new default data subscription.
    Manual,
    /// Data followed a voice call to another slot.
    InCall,
    /// An opportunistic subscription was selected by an operator app.
    Cbrs,
    /// Automatic switch because the primary lost service.
    Auto,
}

impl SwitchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchReason::Unknown => "unknown",
            SwitchReason::Manual => "manual",
            SwitchReason::InCall => "in_call",
            SwitchReason::Cbrs => "cbrs",
            SwitchReason::Auto => "auto",
        }
    }
}

/// Single source of truth for who carries default Internet traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PreferredDataState {
    /// `None` only transiently, before the first evaluation.
    pub preferred_slot: Option<SlotId>,
    pub preferred_sub: Option<SubId>,
    pub primary_sub: Option<SubId>,
    /// `None` means "follow the primary".
    pub auto_selected_sub: Option<SubId>,
    pub last_switch_reason: SwitchReason,
}

/// Outcome reported by the validation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationOutcome {
    Passed,
    Failed,
    /// The candidate network came up but was not (yet) validated. Only
    /// enough when the caller did not require validation.
    NetworkAvailable,
}

/// Which modem command family drives data attach. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandMode {
    /// Per-slot allow/disallow data attach.
    AllowData,
    /// One preferred-data-slot command; every slot may attach.
    PreferredData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_roundtrips_through_str() {
        for state in [
            RegistrationState::NotRegistered,
            RegistrationState::Home,
            RegistrationState::Roaming,
            RegistrationState::Searching,
        ] {
            assert_eq!(state.as_str().parse::<RegistrationState>().unwrap(), state);
        }
        assert!("lost".parse::<RegistrationState>().is_err());
    }

    #[test]
    fn signal_threshold_is_strictly_above_poor() {
        assert!(!SignalLevel::NoneOrUnknown.is_above_poor());
        assert!(!SignalLevel::Poor.is_above_poor());
        assert!(SignalLevel::Moderate.is_above_poor());
        assert!(SignalLevel::Great.is_above_poor());
    }

    #[test]
    fn handover_tolerant_ims_techs() {
        assert!(ImsRegistrationTech::CrossSim.tolerates_data_handover());
        assert!(ImsRegistrationTech::Iwlan.tolerates_data_handover());
        assert!(!ImsRegistrationTech::Lte.tolerates_data_handover());
        assert!(!ImsRegistrationTech::Nr.tolerates_data_handover());
    }

    #[test]
    fn requests_compare_by_value() {
        let a = NetworkRequest::new([Capability::Mms, Capability::Internet], Some(SubId(2)));
        let b = NetworkRequest::new([Capability::Internet, Capability::Mms], Some(SubId(2)));
        assert_eq!(a, b);
        assert_ne!(a, NetworkRequest::internet());
        assert!(a.has(Capability::Mms));
    }

    #[test]
    fn preferred_state_serializes() {
        let state = PreferredDataState {
            preferred_slot: Some(SlotId(1)),
            preferred_sub: Some(SubId(3)),
            primary_sub: Some(SubId(2)),
            auto_selected_sub: Some(SubId(3)),
            last_switch_reason: SwitchReason::Auto,
        };
        let json = serde_json::to_value(state).unwrap();
        assert_eq!(json["preferred_slot"], 1);
        assert_eq!(json["last_switch_reason"], "auto");
    }
}
