//! Control loops for a multi-SIM modem data path.
//!
//! This crate contains:
//! - **Arbiter** — picks the one slot that carries Internet data and drives
//!   the modem there (auto data switch and emergency override included)
//! - **Recovery** — the escalating data-stall recovery ladder
//! - **Collaborators** — traits for everything outside the loops, plus
//!   in-memory implementations
//! - **Runtime** — worker threads, mailboxes and the control plane that
//!   joins the two loops
//! - **Metrics** — Prometheus and JSON telemetry for both loops

pub mod arbiter;
pub mod collab;
pub mod config;
pub mod metrics;
pub mod phone_state;
pub mod recovery;
pub mod registrants;
pub mod registry;
pub mod runtime;
pub mod services;
pub mod timer;

pub use arbiter::{ArbiterEvent, PreferredDataArbiter};
pub use recovery::{DataStallRecoveryManager, RecoveryEvent};
pub use runtime::{ArbiterHandle, ControlPlane, RadioPowerReporter, RecoveryHandle};
