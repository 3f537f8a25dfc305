//! Shared types for the dualsim control plane.
//!
//! This crate contains:
//! - **Identifiers** — `SlotId` / `SubId` newtypes
//! - **Data model** — registration, signal, requests, preferred-data snapshot
//! - **Recovery ladder** — `RecoveryAction`, recovered reasons, stall records
//! - **Notices** — messages published by the arbiter and the recovery manager
//! - **Errors** — command, emergency-override and opportunistic-data failures

pub mod error;
pub mod ids;
pub mod models;
pub mod protocol;
pub mod recovery;

pub use ids::{DEFAULT_EMERGENCY_SLOT, SlotId, SubId};
