//! Outstanding data-capability requests.
//!
//! Owned by the arbiter loop; outside callers go through
//! [`crate::runtime::ArbiterHandle`], which posts add/remove as events.

use std::ops::ControlFlow;

use dualsim_common::SlotId;
use dualsim_common::models::NetworkRequest;

#[derive(Debug, Default)]
pub struct NetworkRequestRegistry {
    requests: Vec<NetworkRequest>,
}

impl NetworkRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless an equal request is already present. Returns whether
    /// the registry changed.
    pub fn add(&mut self, request: NetworkRequest) -> bool {
        if self.requests.contains(&request) {
            return false;
        }
        self.requests.push(request);
        true
    }

    /// Returns whether anything was removed.
    pub fn remove(&mut self, request: &NetworkRequest) -> bool {
        let before = self.requests.len();
        self.requests.retain(|r| r != request);
        before != self.requests.len()
    }

    pub fn contains(&self, request: &NetworkRequest) -> bool {
        self.requests.contains(request)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkRequest> {
        self.requests.iter()
    }

    /// Resolve every request to the slot it targets and hand each resolved
    /// slot to `visit` until it breaks. Requests that resolve to no slot are
    /// skipped.
    pub fn for_each_targeting_slot(
        &self,
        mut resolve: impl FnMut(&NetworkRequest) -> Option<SlotId>,
        mut visit: impl FnMut(SlotId) -> ControlFlow<()>,
    ) {
        for request in &self.requests {
            if let Some(slot) = resolve(request) {
                if visit(slot).is_break() {
                    break;
                }
            }
        }
    }
}
