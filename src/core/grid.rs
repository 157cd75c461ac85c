//! Master Grid: the frozen, versioned slot-id -> order mapping plus its
//! secondary indices. Every mutation passes through
//! [`MasterGrid::apply_order_update`].

use std::collections::{BTreeMap, HashMap, HashSet};

use log::warn;
use ordered_float::OrderedFloat;

use crate::audit_event;

use super::accountant::Accountant;
use super::audit::{AuditCategory, AuditEntry, AuditRing};
use super::errors::{CoreError, CoreResult};
use super::types::{Order, OrderKind, OrderStateTag, Side, SlotId};

const AUDIT_RING_CAPACITY: usize = 100;

/// Options controlling a single `apply_order_update` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOpts {
    /// Skip the optimistic accounting delta. Used by recovery paths that
    /// rebuild the ledger from ground truth instead of layering on top of
    /// it.
    pub skip_accounting: bool,
}

/// Frozen mapping of slot id -> order, with indices by state, by kind, and
/// by price, plus a monotonically increasing version counter and a
/// bounded mutation audit ring.
pub struct MasterGrid {
    orders: HashMap<SlotId, Order>,
    by_state: HashMap<OrderStateTag, HashSet<SlotId>>,
    by_kind: HashMap<OrderKind, HashSet<SlotId>>,
    by_price: BTreeMap<OrderedFloat<f64>, SlotId>,
    version: u64,
    audit: AuditRing,
    bootstrap_depth: u32,
}

impl MasterGrid {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
            by_state: HashMap::new(),
            by_kind: HashMap::new(),
            by_price: BTreeMap::new(),
            version: 0,
            audit: AuditRing::new(AUDIT_RING_CAPACITY),
            bootstrap_depth: 0,
        }
    }

    /// Seed the grid from a persisted or freshly-planned order set,
    /// bypassing the per-call invariant warnings (this is itself a
    /// bootstrap operation).
    pub fn load(orders: Vec<Order>) -> CoreResult<Self> {
        let mut grid = Self::new();
        grid.begin_bootstrap();
        for order in orders {
            grid.insert_unchecked(order)?;
        }
        grid.end_bootstrap();
        Ok(grid)
    }

    fn insert_unchecked(&mut self, order: Order) -> CoreResult<()> {
        if !order.is_well_formed() {
            return Err(CoreError::InvalidState {
                slot_id: order.id.clone(),
                reason: "malformed order on load".into(),
            });
        }
        let id = order.id.clone();
        self.by_state
            .entry(order.state.tag())
            .or_default()
            .insert(id.clone());
        self.by_kind.entry(order.kind).or_default().insert(id.clone());
        self.by_price.insert(OrderedFloat(order.price), id.clone());
        self.orders.insert(id, order);
        Ok(())
    }

    /// Start a bootstrap window: while `bootstrap_depth > 0`, invariant
    /// violations are logged at debug level instead of raised as
    /// warnings. Nestable; callers must pair with `end_bootstrap`.
    pub fn begin_bootstrap(&mut self) {
        self.bootstrap_depth += 1;
    }

    pub fn end_bootstrap(&mut self) {
        self.bootstrap_depth = self.bootstrap_depth.saturating_sub(1);
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrap_depth > 0
    }

    pub fn version(&self) -> u64 {
        self.version
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

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn slots_by_state(&self, tag: OrderStateTag) -> impl Iterator<Item = &SlotId> {
        self.by_state.get(&tag).into_iter().flatten()
    }

    pub fn slots_by_kind(&self, kind: OrderKind) -> impl Iterator<Item = &SlotId> {
        self.by_kind.get(&kind).into_iter().flatten()
    }

    /// Slot ids ordered by ascending price.
    pub fn slots_by_price(&self) -> impl Iterator<Item = &SlotId> {
        self.by_price.values()
    }

    pub fn find_by_chain_order_id(&self, chain_order_id: &str) -> Option<&Order> {
        self.orders
            .values()
            .find(|o| o.chain_order_id().map(String::as_str) == Some(chain_order_id))
    }

    pub fn audit_entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit.iter()
    }

    /// Single mutation entry point. Validates the new order's shape,
    /// updates all indices atomically, bumps the master version, notifies
    /// the accountant (unless `opts.skip_accounting`), and appends an
    /// audit entry. A shape violation is always an error; a *ledger*
    /// invariant violation is reported to the accountant's recovery loop
    /// rather than aborting this call, unless the grid is bootstrapping.
    pub fn apply_order_update(
        &mut self,
        new_order: Order,
        cause: impl Into<String>,
        accountant: &mut Accountant,
        opts: ApplyOpts,
    ) -> CoreResult<()> {
        if !new_order.is_well_formed() {
            return Err(CoreError::InvalidState {
                slot_id: new_order.id.clone(),
                reason: "state/kind/size shape inconsistent".into(),
            });
        }

        let slot_id = new_order.id.clone();
        let old_order = self.orders.get(&slot_id).cloned();

        if let Some(old) = &old_order {
            self.by_state
                .get_mut(&old.state.tag())
                .map(|set| set.remove(&slot_id));
            self.by_kind.get_mut(&old.kind).map(|set| set.remove(&slot_id));
            self.by_price.remove(&OrderedFloat(old.price));
        }

        self.by_state
            .entry(new_order.state.tag())
            .or_default()
            .insert(slot_id.clone());
        self.by_kind
            .entry(new_order.kind)
            .or_default()
            .insert(slot_id.clone());
        self.by_price
            .insert(OrderedFloat(new_order.price), slot_id.clone());

        self.version += 1;
        let cause = cause.into();

        if !opts.skip_accounting {
            accountant.on_order_update(old_order.as_ref(), &new_order, &cause);
        }

        self.orders.insert(slot_id.clone(), new_order.clone());

        audit_event!(
            AuditCategory::OrderStateChanges,
            "slot={} cause={} state={:?}",
            slot_id,
            cause,
            new_order.state.tag()
        );

        self.audit.push(AuditEntry {
            slot_id,
            old_order,
            new_order,
            cause,
            master_version: self.version,
            at: chrono::Utc::now(),
        });

        if !opts.skip_accounting && !self.is_bootstrapping() {
            for side in [Side::Buy, Side::Sell] {
                let violations = accountant.ledger().side(side).check_all(
                    crate::helpers::ledger_tolerance(
                        accountant.ledger().side(side).totals.total,
                        accountant.precision(side),
                    ),
                );
                if !violations.is_empty() {
                    let err = CoreError::InvariantViolation { side, violations };
                    warn!("{err}");
                    accountant.schedule_recovery();
                }
            }
        }

        Ok(())
    }

    /// Best buy / best sell prices currently present with a non-spread
    /// kind, used for the spread-window invariant check (P10).
    pub fn best_buy_sell(&self) -> (Option<f64>, Option<f64>) {
        let best_buy = self
            .slots_by_kind(OrderKind::Buy)
            .filter_map(|id| self.orders.get(id))
            .map(|o| o.price)
            .fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |a| a.max(p)))
            });
        let best_sell = self
            .slots_by_kind(OrderKind::Sell)
            .filter_map(|id| self.orders.get(id))
            .map(|o| o.price)
            .fold(None, |acc: Option<f64>, p| {
                Some(acc.map_or(p, |a| a.min(p)))
            });
        (best_buy, best_sell)
    }

    /// Count of VIRTUAL spread slots strictly between best buy and best
    /// sell (P10).
    pub fn spread_slot_count(&self) -> usize {
        let (best_buy, best_sell) = self.best_buy_sell();
        match (best_buy, best_sell) {
            (Some(buy), Some(sell)) => self
                .orders
                .values()
                .filter(|o| o.kind.is_spread() && o.price > buy && o.price < sell)
                .count(),
            _ => 0,
        }
    }
}

impl Default for MasterGrid {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII bootstrap window: suppresses invariant-violation warnings for as
/// long as it's held, nesting correctly with any other live scope on the
/// same grid. Used by the sync engine and COW pipeline around resync and
/// commit-apply windows where transient mismatch is expected.
pub struct BootstrapScope<'a> {
    grid: &'a mut MasterGrid,
}

impl<'a> BootstrapScope<'a> {
    pub fn enter(grid: &'a mut MasterGrid) -> Self {
        grid.begin_bootstrap();
        Self { grid }
    }
}

impl<'a> Drop for BootstrapScope<'a> {
    fn drop(&mut self) {
        self.grid.end_bootstrap();
    }
}
