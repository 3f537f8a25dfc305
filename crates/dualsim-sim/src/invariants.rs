//! Properties that hold after every input, whatever the sequence.

use dualsim_common::DEFAULT_EMERGENCY_SLOT;
use dualsim_common::models::CommandMode;
use dualsim_core::arbiter::ArbiterSnapshot;
use dualsim_core::collab::SubscriptionSource;
use dualsim_core::collab::memory::MemorySubscriptions;

/// Exactly one preferred slot, holding the preferred subscription, and an
/// attached set the data-attach cap allows.
pub fn check_arbiter(
    snap: &ArbiterSnapshot,
    subs: &MemorySubscriptions,
    max_data_attach: usize,
) -> anyhow::Result<()> {
    let slot_count = subs.active_modem_count();
    let Some(slot) = snap.state.preferred_slot else {
        anyhow::bail!("no preferred slot chosen");
    };
    if slot.index() >= slot_count {
        anyhow::bail!("preferred {} outside {} modems", slot, slot_count);
    }

    match snap.state.preferred_sub {
        Some(sub) => {
            if !sub.is_usable() {
                anyhow::bail!("preferred subscription {} is not usable", sub);
            }
            let held = subs.slot(slot).and_then(|e| e.sub);
            if held != Some(sub) {
                anyhow::bail!("preferred {} holds {:?}, not {}", slot, held, sub);
            }
        }
        // Either the no-SIM default or an override pinned to an empty slot.
        None => {
            if slot != DEFAULT_EMERGENCY_SLOT && snap.emergency_slot != Some(slot) {
                anyhow::bail!("{} preferred without a subscription", slot);
            }
        }
    }

    if snap.mode == CommandMode::AllowData && max_data_attach < slot_count {
        let attached = snap.slots.iter().filter(|s| s.requested_active).count();
        if attached == 0 || attached > max_data_attach {
            anyhow::bail!(
                "{} slots attached, allowed 1..={}",
                attached,
                max_data_attach
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceSetup, SimDevice};
    use dualsim_common::SlotId;
    use dualsim_core::arbiter::ArbiterEvent;
    use dualsim_core::config::DaemonConfig;

    #[test]
    fn holds_through_sim_removal() {
        let mut sim = SimDevice::start(DeviceSetup::default().build(), DaemonConfig::default());
        sim.device.subscriptions.remove_sim(SlotId(0));
        sim.arbiter_event(ArbiterEvent::SubscriptionMappingChanged);
        sim.check_invariants().unwrap();
        assert_eq!(sim.preferred(), Some(SlotId(1)));

        sim.device.subscriptions.remove_sim(SlotId(1));
        sim.arbiter_event(ArbiterEvent::SubscriptionMappingChanged);
        sim.check_invariants().unwrap();
        assert_eq!(sim.preferred(), Some(DEFAULT_EMERGENCY_SLOT));
    }

    #[test]
    fn flags_a_stale_subscription_table() {
        let sim = SimDevice::start(DeviceSetup::default().build(), DaemonConfig::default());
        // Mutate the table without telling the arbiter.
        sim.device.subscriptions.remove_sim(SlotId(0));
        let err = check_arbiter(&sim.arbiter.snapshot(), &sim.device.subscriptions, 1)
            .unwrap_err();
        assert!(err.to_string().contains("holds None"), "{err}");
    }
}
