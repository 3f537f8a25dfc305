//! Scenario driver for the dualsim control plane.
//!
//! - [`scenario`] runs TOML scripts step by step with expectations.
//! - [`walk`] drives seeded random event streams on a mock clock.
//! - [`soak`] feeds random events to the threaded control plane in real time.
//!
//! All three check the single-preferred-slot [`invariants`] after every
//! input.

pub mod device;
pub mod events;
pub mod invariants;
pub mod scenario;
pub mod soak;
pub mod walk;

pub use device::{DeviceSetup, SimDevice};
pub use scenario::{ScenarioReport, ScenarioScript};
pub use walk::{Walk, WalkConfig, WalkReport};
