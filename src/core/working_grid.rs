//! Working grid: a transient, independently-owned clone of the frozen
//! master grid used for exactly one COW pipeline attempt.

use std::collections::{HashMap, HashSet};

use super::grid::MasterGrid;
use super::types::{Order, OrderKind, OrderStateTag, SlotId};

/// One rebalance attempt's private copy of the grid. Deep-cloned from the
/// master at `base_version`; independence from master is load-bearing —
/// mutating a working grid must never be observable through the master
/// it was cloned from.
pub struct WorkingGrid {
    orders: HashMap<SlotId, Order>,
    base_version: u64,
    modified: HashSet<SlotId>,
    stale: Option<String>,
}

impl WorkingGrid {
    /// Deep-clones every order out of `master` at its current version.
    pub fn freeze(master: &MasterGrid) -> Self {
        let orders = master
            .iter()
            .map(|order| (order.id.clone(), order.clone()))
            .collect();
        Self {
            orders,
            base_version: master.version(),
            modified: HashSet::new(),
            stale: None,
        }
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn is_stale(&self) -> bool {
        self.stale.is_some()
    }

    pub fn stale_reason(&self) -> Option<&str> {
        self.stale.as_deref()
    }

    pub fn get(&self, slot_id: &str) -> Option<&Order> {
        self.orders.get(slot_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    /// Project a planned order into the working grid, recording the slot
    /// as modified relative to the frozen snapshot.
    pub fn set(&mut self, order: Order) {
        self.modified.insert(order.id.clone());
        self.orders.insert(order.id.clone(), order);
    }

    pub fn modified_slots(&self) -> impl Iterator<Item = &SlotId> {
        self.modified.iter()
    }

    /// Slots currently in `tag`, recomputed on demand rather than
    /// maintained incrementally — this grid lives for one pipeline
    /// attempt, so there's no steady-state cost to amortize.
    pub fn slots_by_state(&self, tag: OrderStateTag) -> Vec<&SlotId> {
        self.orders
            .values()
            .filter(|o| o.state.tag() == tag)
            .map(|o| &o.id)
            .collect()
    }

    pub fn slots_by_kind(&self, kind: OrderKind) -> Vec<&SlotId> {
        self.orders
            .values()
            .filter(|o| o.kind == kind)
            .map(|o| &o.id)
            .collect()
    }

    /// Slot ids ordered by ascending price.
    pub fn slots_by_price(&self) -> Vec<&SlotId> {
        let mut ids: Vec<&Order> = self.orders.values().collect();
        ids.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap());
        ids.into_iter().map(|o| &o.id).collect()
    }

    /// Re-clones one slot from `master` into this working grid, marks it
    /// stale with a phase-tagged reason, and advances `base_version` to
    /// match. Called when a fill lands on master while a rebalance is in
    /// flight (staleness handling, §4.5 step 6).
    pub fn sync_from_master(&mut self, slot_id: &SlotId, master: &MasterGrid, phase: &str) {
        if let Some(order) = master.get(slot_id) {
            self.orders.insert(slot_id.clone(), order.clone());
        }
        self.base_version = master.version();
        self.stale = Some(format!(
            "slot {slot_id} resynced from master during {phase}"
        ));
    }
}
