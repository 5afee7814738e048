//! Process-wide crane-by-hub registry.
//!
//! Expansion looks up the next hop here. The map is read-mostly: cranes are
//! assigned once after their handshake and retracted on termination.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::crane::{Crane, HubId};

static CRANES: OnceLock<RwLock<HashMap<HubId, Arc<Crane>>>> = OnceLock::new();

fn table() -> &'static RwLock<HashMap<HubId, Arc<Crane>>> {
    CRANES.get_or_init(Default::default)
}

/// Record `crane` as the way to reach `hub`. A later assignment for the
/// same hub replaces the earlier one.
pub fn assign_crane(hub: HubId, crane: Arc<Crane>) {
    tracing::debug!(%hub, crane = %crane.id(), "assigning crane");
    crane.note_assignment(hub.clone());
    table().write().insert(hub, crane);
}

/// The crane assigned to `hub`, if any.
pub fn crane_by_hub(hub: &HubId) -> Option<Arc<Crane>> {
    table().read().get(hub).cloned()
}

/// Drop `crane_id`'s entries for `hubs`; newer assignments are kept.
pub(crate) fn retract(crane_id: &str, hubs: &[HubId]) {
    let mut table = table().write();
    for hub in hubs {
        if table.get(hub).is_some_and(|crane| crane.id() == crane_id) {
            table.remove(hub);
        }
    }
}
