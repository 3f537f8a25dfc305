//! Process-wide handles to the running control loops.
//!
//! Nothing inside the loops reads this; they get their collaborators at
//! construction. Only a composition root installs the handles, once, so
//! that code far from it (signal handlers, status dumps) can reach them.

use once_cell::sync::OnceCell;

use crate::metrics::TelemetryHandle;
use crate::runtime::{ArbiterHandle, ControlPlane, RecoveryHandle};

#[derive(Clone)]
pub struct Services {
    pub arbiter: ArbiterHandle,
    pub recovery: RecoveryHandle,
    pub telemetry: TelemetryHandle,
}

static SERVICES: OnceCell<Services> = OnceCell::new();

impl Services {
    pub fn from_plane(plane: &ControlPlane) -> Self {
        Self {
            arbiter: plane.arbiter(),
            recovery: plane.recovery(),
            telemetry: plane.telemetry(),
        }
    }
}

/// Install the handles. Fails if they were already installed.
pub fn install(services: Services) -> anyhow::Result<()> {
    SERVICES
        .set(services)
        .map_err(|_| anyhow::anyhow!("Services already installed"))
}

pub fn get() -> Option<&'static Services> {
    SERVICES.get()
}
