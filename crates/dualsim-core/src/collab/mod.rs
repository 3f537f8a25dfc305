//! Collaborator interfaces.
//!
//! The control loops never talk to a modem, a SIM database or a settings
//! provider directly; they go through these traits. Everything is
//! procedure-call shaped. Anything asynchronous (modem command completion,
//! validation results) is delivered through a boxed callback that the loop
//! builds to post a message back into its own mailbox.
//!
//! [`memory`] provides in-process implementations used by tests and by the
//! scenario runner.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use dualsim_common::error::CommandError;
use dualsim_common::models::{ImsRegistrationTech, RegistrationState, SignalLevel, ValidationOutcome};
use dualsim_common::{SlotId, SubId};

/// Completion for an asynchronous modem command. Called exactly once, from
/// any thread.
pub type CommandReply = Box<dyn FnOnce(Result<(), CommandError>) + Send>;

/// Delivery for a validation request. Called at most once; never called
/// after `stop_validation`.
pub type ValidationCallback = Box<dyn FnOnce(SubId, ValidationOutcome) + Send>;

/// Black-box modem command channel.
pub trait RadioChannel: Send + Sync {
    /// Whether the modem takes a single preferred-data-slot command instead
    /// of per-slot allow/disallow. Read once at startup.
    fn supports_preferred_data_slot(&self) -> bool;

    fn activate(&self, slot: SlotId, reply: CommandReply);
    fn deactivate(&self, slot: SlotId, reply: CommandReply);
    fn set_preferred_data_slot(&self, slot: SlotId, reply: CommandReply);

    fn power_cycle(&self, slot: SlotId);
    fn reset_modem(&self, slot: SlotId);
    fn query_data_call_list(&self, slot: SlotId);
}

/// Subscription and registration truth.
pub trait SubscriptionSource: Send + Sync {
    fn active_modem_count(&self) -> usize;
    fn default_data_subscription(&self) -> Option<SubId>;
    fn subscription_for_slot(&self, slot: SlotId) -> Option<SubId>;
    fn is_subscription_active(&self, sub: SubId) -> bool;
    fn registration_state(&self, slot: SlotId) -> RegistrationState;
}

/// End-to-end validation of a candidate data path.
pub trait Validator: Send + Sync {
    /// Start validating `sub`. Replaces any validation in flight. When
    /// `need_validation` is false the validator may report
    /// [`ValidationOutcome::NetworkAvailable`] as soon as the network is up.
    fn validate(
        &self,
        sub: SubId,
        timeout: Duration,
        need_validation: bool,
        callback: ValidationCallback,
    );
    fn stop_validation(&self);
    fn is_validating(&self) -> bool;
}

pub trait CallMonitor: Send + Sync {
    /// Slot with an active (or originating) voice call.
    fn active_call_slot(&self) -> Option<SlotId>;
    fn ims_registration_tech(&self, slot: SlotId) -> ImsRegistrationTech;
}

/// Internet data network owned by the data layer.
pub trait DataNetworkController: Send + Sync {
    /// Tear down and rebuild the Internet data network on `slot`.
    fn reestablish_internet(&self, slot: SlotId);
    /// Data policy (user toggle, roaming, carrier policy) allows Internet.
    fn is_internet_data_allowed(&self, slot: SlotId) -> bool;
}

pub trait SignalSource: Send + Sync {
    fn signal_level(&self, slot: SlotId) -> SignalLevel;
}

/// Keys of the persisted toggles the control loops read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingKey {
    UserDataEnabled(SubId),
    /// Mobile-data policy: allow data on this subscription during a voice
    /// call on it, even when it is not the default.
    DataDuringCall(SubId),
    /// Mobile-data policy: the subscription may take over data when the
    /// primary loses service.
    AutoDataSwitch(SubId),
}

impl SettingKey {
    /// Value used when the store has never seen the key.
    pub fn default_value(&self) -> bool {
        match self {
            SettingKey::UserDataEnabled(_) => true,
            SettingKey::DataDuringCall(_) | SettingKey::AutoDataSwitch(_) => false,
        }
    }
}

/// Key-value store for persisted toggles. The persistence mechanism is the
/// implementor's business.
pub trait SettingsStore: Send + Sync {
    fn get_bool(&self, key: SettingKey) -> Option<bool>;
    fn set_bool(&self, key: SettingKey, value: bool);

    fn get_or_default(&self, key: SettingKey) -> bool {
        self.get_bool(key).unwrap_or_else(|| key.default_value())
    }
}

/// Every collaborator the two loops need, shared between them.
#[derive(Clone)]
pub struct Collaborators {
    pub radio: Arc<dyn RadioChannel>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub validator: Arc<dyn Validator>,
    pub calls: Arc<dyn CallMonitor>,
    pub data_network: Arc<dyn DataNetworkController>,
    pub signal: Arc<dyn SignalSource>,
    pub settings: Arc<dyn SettingsStore>,
}
