//! Slot and subscription identifiers.
//!
//! A [`SlotId`] is a modem index (`0..N-1`); a [`SubId`] names a SIM profile.
//! Both are small `Copy` newtypes so the two can never be swapped at a call
//! site.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Modem slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub usize);

/// Slot that carries data when no subscription is active anywhere.
pub const DEFAULT_EMERGENCY_SLOT: SlotId = SlotId(0);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

impl From<usize> for SlotId {
    fn from(v: usize) -> Self {
        SlotId(v)
    }
}

/// Subscription identifier. Only positive values are usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubId(pub i32);

impl SubId {
    /// Whether this id can name a real subscription.
    pub fn is_usable(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

impl From<i32> for SubId {
    fn from(v: i32) -> Self {
        SubId(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_prefixed() {
        assert_eq!(SlotId(1).to_string(), "slot1");
        assert_eq!(SubId(7).to_string(), "sub7");
    }

    #[test]
    fn non_positive_sub_is_not_usable() {
        assert!(!SubId(0).is_usable());
        assert!(!SubId(-1).is_usable());
        assert!(SubId(1).is_usable());
    }

    #[test]
    fn ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&SlotId(2)).unwrap(), "2");
        assert_eq!(serde_json::to_string(&SubId(5)).unwrap(), "5");
    }
}
