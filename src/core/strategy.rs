//! Strategy: the pure planner. Reads a frozen grid view, the fund
//! snapshot and recent fills; produces a target grid for the COW
//! pipeline to diff against. Never mutates anything itself.

use std::collections::HashMap;

use crate::consts::{
    GRID_REGENERATION_PERCENTAGE, MIN_ORDER_SIZE_FACTOR, MIN_SPREAD_ORDERS,
    PARTIAL_ACTIVE_RESTORE_RATIO, PARTIAL_DUST_THRESHOLD_PERCENTAGE, RMS_PERCENTAGE,
};
use crate::helpers::approx_eq;

use super::grid::MasterGrid;
use super::types::{Order, OrderKind, OrderState, Side, SlotId};
use super::working_grid::WorkingGrid;

/// Read-only view over a grid, implemented for both the frozen master
/// and a working grid, so the planner can run against either.
pub trait GridView {
    fn order(&self, slot_id: &str) -> Option<&Order>;
    /// Slot ids ascending by price.
    fn price_ordered_slot_ids(&self) -> Vec<SlotId>;

    fn slot_ids_by_kind(&self, kind: OrderKind) -> Vec<SlotId> {
        self.price_ordered_slot_ids()
            .into_iter()
            .filter(|id| self.order(id).map(|o| o.kind) == Some(kind))
            .collect()
    }
}

impl GridView for MasterGrid {
    fn order(&self, slot_id: &str) -> Option<&Order> {
        MasterGrid::get(self, slot_id)
    }

    fn price_ordered_slot_ids(&self) -> Vec<SlotId> {
        self.slots_by_price().cloned().collect()
    }
}

impl GridView for WorkingGrid {
    fn order(&self, slot_id: &str) -> Option<&Order> {
        WorkingGrid::get(self, slot_id)
    }

    fn price_ordered_slot_ids(&self) -> Vec<SlotId> {
        self.slots_by_price().into_iter().cloned().collect()
    }
}

/// One filled order, as input to the boundary crawl.
#[derive(Debug, Clone, Copy)]
pub struct FillEvent {
    pub side: Side,
}

/// Phase A: each fill shifts the boundary one slot toward the filled
/// side. A BUY fill means the market moved up, so the boundary (the
/// index between the last BUY and the first SELL) moves up too.
pub fn plan_boundary_crawl(current_boundary: i64, fills: &[FillEvent]) -> i64 {
    fills.iter().fold(current_boundary, |boundary, fill| {
        match fill.side {
            Side::Buy => boundary + 1,
            Side::Sell => boundary - 1,
        }
    })
}

/// Recovers the boundary on cold start from whichever on-chain order sits
/// closest to the market: the lowest SELL or highest BUY with a
/// `chain_order_id`. Falls back to `start_index` (derived from
/// `startPrice`) when nothing is on chain yet.
pub fn recover_boundary(view: &dyn GridView, start_index: i64) -> i64 {
    let buys = view.slot_ids_by_kind(OrderKind::Buy);
    let sells = view.slot_ids_by_kind(OrderKind::Sell);

    let highest_onchain_buy_idx = buys.iter().enumerate().rev().find_map(|(i, id)| {
        view.order(id)
            .filter(|o| o.state.is_on_chain())
            .map(|_| i)
    });
    if let Some(idx) = highest_onchain_buy_idx {
        return idx as i64 + 1;
    }

    let lowest_onchain_sell_idx = sells.iter().enumerate().find_map(|(i, id)| {
        view.order(id)
            .filter(|o| o.state.is_on_chain())
            .map(|_| i)
    });
    if let Some(idx) = lowest_onchain_sell_idx {
        return buys.len() as i64 - idx as i64;
    }

    start_index
}

/// Phase B: geometric distribution of `allocated` over an
/// already-ordered, market-closest-first topology. `weight` in (0, 1);
/// 0.5 is linear (equal shares), values above 0.5 bias toward the
/// market-closest slot, below 0.5 bias toward the far end.
pub fn plan_side_sizing(topology: &[SlotId], allocated: f64, weight: f64) -> HashMap<SlotId, f64> {
    let n = topology.len();
    let mut sizes = HashMap::with_capacity(n);
    if n == 0 || allocated <= 0.0 {
        return sizes;
    }

    let weight = weight.clamp(0.01, 0.99);
    let ratio = weight / (1.0 - weight);

    let raw: Vec<f64> = (0..n).map(|i| ratio.powi((n - 1 - i) as i32)).collect();
    let total: f64 = raw.iter().sum();

    for (slot_id, share) in topology.iter().zip(raw.iter()) {
        sizes.insert(slot_id.clone(), allocated * share / total);
    }
    sizes
}

/// RMS of relative size differences between current and freshly-computed
/// ideal sizes, as a percentage. Drives the grid-divergence trigger.
pub fn size_divergence_rms_percent(current: &[f64], ideal: &[f64]) -> f64 {
    let n = current.len().min(ideal.len());
    if n == 0 {
        return 0.0;
    }
    let sum_sq: f64 = current
        .iter()
        .zip(ideal.iter())
        .take(n)
        .map(|(c, i)| {
            if *i == 0.0 {
                0.0
            } else {
                let rel = (c - i) / i;
                rel * rel
            }
        })
        .sum();
    ((sum_sq / n as f64).sqrt()) * 100.0
}

pub fn should_regenerate_side(rms_percent: f64, side_cache_funds: f64, side_committed_total: f64) -> bool {
    if side_committed_total <= 0.0 {
        return false;
    }
    rms_percent > RMS_PERCENTAGE && (side_cache_funds / side_committed_total) > GRID_REGENERATION_PERCENTAGE
}

/// What the planner decided to do with one slot.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Keep,
    Update { size: f64 },
    Place { size: f64 },
    Cancel,
    /// Cancel `donor` and place this slot at `size`, executed as one
    /// rotation unit. `donor` is never equal to the slot this action is
    /// attached to (self-rotation is prohibited; see `plan_rotations`).
    Rotate { donor: SlotId, size: f64 },
    /// A shrinking non-dust PARTIAL resized to `size` in place, with the
    /// excess carried into `excess_slot` (VIRTUAL at plan time). Counts as
    /// one chain-touching unit against the reaction cap, like `Rotate`.
    Split {
        excess_slot: SlotId,
        excess_size: f64,
        size: f64,
    },
}

/// One planned (slot, action) pair.
pub type PlannedStep = (SlotId, PlannedAction);

/// Phase C, non-rotation part: classify each slot against its target
/// size using Keep/Update/Place/Cancel. PARTIAL dust/restore policy is
/// applied here; rotations are planned separately by `plan_rotations`
/// against the slots this function leaves as `Cancel`/`Place`.
pub fn plan_roles(
    view: &dyn GridView,
    targets: &HashMap<SlotId, f64>,
    tolerance: f64,
    min_order_size: f64,
) -> Vec<PlannedStep> {
    let mut steps = Vec::new();
    let ordered = view.price_ordered_slot_ids();

    for slot_id in ordered.iter().cloned() {
        let Some(order) = view.order(&slot_id) else {
            continue;
        };
        if order.kind.is_spread() {
            continue;
        }
        let target = targets.get(&slot_id).copied().unwrap_or(0.0);

        match &order.state {
            OrderState::Virtual => {
                if target >= min_order_size {
                    steps.push((slot_id, PlannedAction::Place { size: target }));
                } else {
                    steps.push((slot_id, PlannedAction::Keep));
                }
            }
            OrderState::Active { .. } => {
                if target < min_order_size {
                    steps.push((slot_id, PlannedAction::Cancel));
                } else if approx_eq(order.size, target, tolerance) {
                    steps.push((slot_id, PlannedAction::Keep));
                } else {
                    steps.push((slot_id, PlannedAction::Update { size: target }));
                }
            }
            OrderState::Partial { .. } => {
                let dust_ratio = if order.ideal_size > 0.0 {
                    order.size / order.ideal_size
                } else {
                    1.0
                };
                if dust_ratio < PARTIAL_DUST_THRESHOLD_PERCENTAGE {
                    // Dust PARTIAL: rotated away, slot goes VIRTUAL and a
                    // fresh replacement is planned elsewhere.
                    steps.push((slot_id, PlannedAction::Cancel));
                } else if target < min_order_size {
                    steps.push((slot_id, PlannedAction::Cancel));
                } else if dust_ratio >= PARTIAL_ACTIVE_RESTORE_RATIO
                    && approx_eq(order.size, target, tolerance)
                {
                    steps.push((slot_id, PlannedAction::Keep));
                } else if target < order.size - tolerance {
                    // Non-dust PARTIAL shrinking below its current size:
                    // split the excess into an adjacent VIRTUAL slot
                    // rather than letting it evaporate; if no VIRTUAL
                    // neighbor is available, skip the operation entirely
                    // (capital-leak safeguard) rather than guess.
                    match find_adjacent_virtual(view, &ordered, &slot_id, order.kind) {
                        Some(excess_slot) => steps.push((
                            slot_id.clone(),
                            PlannedAction::Split {
                                excess_slot,
                                excess_size: order.size - target,
                                size: target,
                            },
                        )),
                        None => steps.push((slot_id, PlannedAction::Keep)),
                    }
                } else {
                    // Non-dust PARTIAL topping up: prefer in-place update.
                    steps.push((slot_id, PlannedAction::Update { size: target }));
                }
            }
        }
    }

    steps
}

/// Phase C, rotation planning. Converts the furthest-from-market
/// `Cancel`s into donors for the nearest `Place`s, using **separate**
/// surplus/shortage cursors: skipping an invalid surplus (e.g. it became
/// VIRTUAL mid-plan, so it's not a real donor) must not skip the
/// corresponding shortage. A donor is never paired with its own slot
/// (self-rotation); if the only available donor is the shortage slot
/// itself, the entry is left as a plain `Place` instead.
///
/// Budget gating (the reaction cap) is enforced separately by
/// `enforce_reaction_cap` once every side's steps are combined, so this
/// function always runs the full pairing pass.
pub fn plan_rotations(steps: Vec<PlannedStep>, view: &dyn GridView) -> Vec<PlannedStep> {
    let mut donors: Vec<SlotId> = steps
        .iter()
        .filter(|(_, a)| matches!(a, PlannedAction::Cancel))
        .map(|(id, _)| id.clone())
        .collect();
    // Furthest-from-market first: donors is already price-ordered from
    // plan_roles, so reverse to prefer the far end as per spec.
    donors.reverse();

    let mut recipients: Vec<SlotId> = steps
        .iter()
        .filter(|(_, a)| matches!(a, PlannedAction::Place { .. }))
        .map(|(id, _)| id.clone())
        .collect();

    let mut by_slot: HashMap<SlotId, PlannedAction> =
        steps.into_iter().collect::<HashMap<_, _>>();

    let mut donor_idx = 0usize;
    let mut recipient_idx = 0usize;

    while donor_idx < donors.len() && recipient_idx < recipients.len() {
        let donor_id = &donors[donor_idx];
        // Separate-index invariant: an invalid donor only advances the
        // donor cursor, never the recipient cursor.
        if !matches!(by_slot.get(donor_id), Some(PlannedAction::Cancel)) {
            donor_idx += 1;
            continue;
        }
        let recipient_id = &recipients[recipient_idx];
        if donor_id == recipient_id {
            // Self-rotation would occur; leave the shortage as a plain
            // Place and move to the next recipient instead.
            recipient_idx += 1;
            continue;
        }
        if view.order(donor_id).is_none() {
            donor_idx += 1;
            continue;
        }

        let size = match by_slot.get(recipient_id) {
            Some(PlannedAction::Place { size }) => *size,
            _ => {
                recipient_idx += 1;
                continue;
            }
        };

        by_slot.insert(
            recipient_id.clone(),
            PlannedAction::Rotate {
                donor: donor_id.clone(),
                size,
            },
        );
        by_slot.insert(donor_id.clone(), PlannedAction::Cancel);

        donor_idx += 1;
        recipient_idx += 1;
    }

    by_slot.into_iter().collect()
}

/// Enforces the reaction cap as one shared budget across every
/// chain-touching action kind for the cycle: dust-consolidation, split,
/// placement, update and rotation each consume one unit regardless of
/// which side or phase produced them. Once the cap is spent, remaining
/// actions revert to `Keep` so they're retried next cycle rather than
/// thrashing past the budget. A `Rotate`'s paired donor `Cancel` bills
/// through the `Rotate` itself (one unit for the pair); if the cap cuts
/// off a `Rotate`, its donor reverts to `Keep` too rather than cancelling
/// an order with nowhere for the capital to land.
pub fn enforce_reaction_cap(steps: Vec<PlannedStep>, cap: u32) -> Vec<PlannedStep> {
    let donor_ids: std::collections::HashSet<SlotId> = steps
        .iter()
        .filter_map(|(_, action)| match action {
            PlannedAction::Rotate { donor, .. } => Some(donor.clone()),
            _ => None,
        })
        .collect();

    let mut used = 0u32;
    let mut severed_donors: std::collections::HashSet<SlotId> = std::collections::HashSet::new();

    let mut out: Vec<PlannedStep> = steps
        .into_iter()
        .map(|(slot_id, action)| {
            if matches!(action, PlannedAction::Keep) || donor_ids.contains(&slot_id) {
                return (slot_id, action);
            }
            if used >= cap {
                if let PlannedAction::Rotate { donor, .. } = &action {
                    severed_donors.insert(donor.clone());
                }
                (slot_id, PlannedAction::Keep)
            } else {
                used += 1;
                (slot_id, action)
            }
        })
        .collect();

    if !severed_donors.is_empty() {
        for (slot_id, action) in out.iter_mut() {
            if severed_donors.contains(slot_id) {
                *action = PlannedAction::Keep;
            }
        }
    }

    out
}

/// Spread correction: if fewer than `MIN_SPREAD_ORDERS` empty slots
/// remain between best buy and best sell, returns the ids of the
/// nearest-to-spread occupied slots on each side that should donate size
/// to restore a spread slot, even with zero free funds (committed
/// inventory fallback).
pub fn plan_spread_correction(
    spread_slot_count: usize,
    nearest_buy: Option<SlotId>,
    nearest_sell: Option<SlotId>,
) -> Vec<SlotId> {
    if spread_slot_count >= MIN_SPREAD_ORDERS {
        return Vec::new();
    }
    [nearest_buy, nearest_sell].into_iter().flatten().collect()
}

pub fn min_order_size(blockchain_minimum: f64) -> f64 {
    blockchain_minimum * MIN_ORDER_SIZE_FACTOR
}

/// Checks whether two price-ordered slot lists consider `a` and `b`
/// adjacent (differ by exactly one position). Used by the PARTIAL-split
/// occupancy check.
pub fn is_adjacent(ordered_ids: &[SlotId], a: &str, b: &str) -> bool {
    let pos_a = ordered_ids.iter().position(|s| s == a);
    let pos_b = ordered_ids.iter().position(|s| s == b);
    match (pos_a, pos_b) {
        (Some(pa), Some(pb)) => (pa as i64 - pb as i64).abs() == 1,
        _ => false,
    }
}

/// Finds a neighbor of `slot_id` (adjacent by price order, same kind)
/// that is currently VIRTUAL: the only destination a shrinking non-dust
/// PARTIAL is allowed to carry its excess into.
fn find_adjacent_virtual(
    view: &dyn GridView,
    ordered: &[SlotId],
    slot_id: &str,
    kind: OrderKind,
) -> Option<SlotId> {
    ordered
        .iter()
        .find(|candidate| {
            candidate.as_str() != slot_id
                && is_adjacent(ordered, slot_id, candidate)
                && view.order(candidate).map(|o| o.kind) == Some(kind)
                && view.order(candidate).map(|o| o.state.is_virtual()).unwrap_or(false)
        })
        .cloned()
}
