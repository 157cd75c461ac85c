//! Copy-on-write rebalance pipeline: freeze the master grid, clone it
//! into a working grid, run the strategy, diff, broadcast, and
//! commit-or-discard.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{info, warn};

use crate::audit_event;
use crate::consts::EPSILON;
use crate::helpers::approx_eq;

use super::accountant::Accountant;
use super::audit::AuditCategory;
use super::errors::{CoreError, CoreResult};
use super::grid::{ApplyOpts, MasterGrid};
use super::types::{ChainOrderId, Order, OrderKind, OrderState, RebalanceState, Side, SlotId};
use super::working_grid::WorkingGrid;

/// One broadcast-bound action, built from the working-vs-master diff.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create {
        slot_id: SlotId,
        price: f64,
        size: f64,
        kind: OrderKind,
    },
    Cancel {
        slot_id: SlotId,
        chain_order_id: ChainOrderId,
    },
    Update {
        slot_id: SlotId,
        chain_order_id: ChainOrderId,
        new_price: Option<f64>,
        new_size: Option<f64>,
    },
}

impl Action {
    pub fn slot_id(&self) -> &SlotId {
        match self {
            Action::Create { slot_id, .. } => slot_id,
            Action::Cancel { slot_id, .. } => slot_id,
            Action::Update { slot_id, .. } => slot_id,
        }
    }
}

/// Outcome of one broadcast action as reported by the chain client.
#[derive(Debug, Clone)]
pub enum BroadcastResult {
    Created {
        slot_id: SlotId,
        chain_order_id: ChainOrderId,
    },
    Acked {
        slot_id: SlotId,
    },
    Failed {
        slot_id: SlotId,
        message: String,
    },
}

/// External broadcast collaborator. Implementations live in the chain
/// module; the pipeline only depends on this trait so it stays testable
/// with a mock.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn broadcast_batch(&self, actions: Vec<Action>) -> CoreResult<Vec<BroadcastResult>>;
}

/// Per-side allocated budget, computed upstream as
/// `free + committed + cacheFunds`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatedFunds {
    pub buy: f64,
    pub sell: f64,
}

impl AllocatedFunds {
    fn side(&self, side: Side) -> f64 {
        match side {
            Side::Buy => self.buy,
            Side::Sell => self.sell,
        }
    }
}

fn side_of(kind: OrderKind) -> Option<Side> {
    match kind {
        OrderKind::Buy => Some(Side::Buy),
        OrderKind::Sell => Some(Side::Sell),
        OrderKind::Spread => None,
    }
}

/// Outcome of a full pipeline attempt.
#[derive(Debug)]
pub enum PipelineOutcome {
    Committed { actions_applied: usize, new_version: u64 },
    DiscardedStale { reason: String },
    NoOp,
}

/// Drives one rebalance attempt end to end. Owns no grid state itself —
/// it's handed the master grid and accountant for the duration of a
/// single `run` call, matching the single-threaded cooperative
/// concurrency model where only one rebalance is ever in flight.
pub struct CowPipeline<'a> {
    grid: &'a mut MasterGrid,
    accountant: &'a mut Accountant,
    state: RebalanceState,
}

impl<'a> CowPipeline<'a> {
    pub fn new(grid: &'a mut MasterGrid, accountant: &'a mut Accountant) -> Self {
        Self {
            grid,
            accountant,
            state: RebalanceState::Normal,
        }
    }

    pub fn state(&self) -> RebalanceState {
        self.state
    }

    /// Step 1: freeze & clone.
    pub fn freeze(&self) -> WorkingGrid {
        WorkingGrid::freeze(self.grid)
    }

    /// Step 2: project a strategy-computed target size per slot into the
    /// working grid, applying the accounting contract: an ACTIVE target
    /// with no prior `chain_order_id` stays VIRTUAL (only a confirmed
    /// chain placement flips it, which is what triggers the optimistic
    /// fund deduction), a type change forces VIRTUAL, and a zero target
    /// forces VIRTUAL too.
    pub fn plan(&mut self, working: &mut WorkingGrid, targets: &HashMap<SlotId, (OrderKind, f64)>) {
        self.state = RebalanceState::Rebalancing;

        for (slot_id, (target_kind, target_size)) in targets {
            let Some(existing) = working.get(slot_id).cloned() else {
                continue;
            };

            let projected = if *target_kind != existing.kind {
                Order {
                    kind: *target_kind,
                    state: OrderState::Virtual,
                    size: *target_size,
                    ideal_size: *target_size,
                    raw_on_chain: None,
                    ..existing
                }
            } else if *target_size <= 0.0 {
                Order {
                    state: OrderState::Virtual,
                    size: 0.0,
                    raw_on_chain: None,
                    ..existing
                }
            } else if existing.state.chain_order_id().is_some() {
                // Already on chain: keep state, just retarget the size.
                Order {
                    size: *target_size,
                    ..existing
                }
            } else {
                // No prior chain order id: stays VIRTUAL even if the
                // target role looks like it should be ACTIVE/PARTIAL.
                Order {
                    state: OrderState::Virtual,
                    size: *target_size,
                    ideal_size: *target_size,
                    ..existing
                }
            };

            working.set(projected);
        }
    }

    /// Step 3: diff working vs frozen master using epsilon-tolerant
    /// comparison. Updates where every field matches are skipped.
    pub fn delta(&self, working: &WorkingGrid) -> Vec<Action> {
        let mut actions = Vec::new();

        for slot_id in working.modified_slots() {
            let Some(new_order) = working.get(slot_id) else {
                continue;
            };
            let old_order = self.grid.get(slot_id);

            match (old_order, &new_order.state) {
                (Some(old), _) if old.state.chain_order_id().is_some() && new_order.state.is_virtual() => {
                    actions.push(Action::Cancel {
                        slot_id: slot_id.clone(),
                        chain_order_id: old.state.chain_order_id().unwrap().clone(),
                    });
                }
                (_, OrderState::Virtual) => {
                    if new_order.size >= EPSILON {
                        actions.push(Action::Create {
                            slot_id: slot_id.clone(),
                            price: new_order.price,
                            size: new_order.size,
                            kind: new_order.kind,
                        });
                    }
                }
                (Some(old), _) => {
                    let price_changed = !approx_eq(old.price, new_order.price, EPSILON);
                    let size_changed = !approx_eq(old.size, new_order.size, EPSILON);
                    if !price_changed && !size_changed {
                        continue;
                    }
                    if let Some(chain_order_id) = new_order.state.chain_order_id() {
                        actions.push(Action::Update {
                            slot_id: slot_id.clone(),
                            chain_order_id: chain_order_id.clone(),
                            new_price: price_changed.then_some(new_order.price),
                            new_size: size_changed.then_some(new_order.size),
                        });
                    }
                }
                (None, _) => {}
            }
        }

        actions
    }

    /// Step 4: fund pre-validation. Simulates total committed from the
    /// working grid and verifies it doesn't exceed the allocated budget
    /// beyond a float-noise tolerance.
    pub fn validate_funds(&self, working: &WorkingGrid, allocated: &AllocatedFunds) -> CoreResult<()> {
        let mut committed = AllocatedFunds::default();
        for order in working.iter() {
            if let Some(side) = side_of(order.kind) {
                if order.state.is_on_chain() || order.size > 0.0 {
                    match side {
                        Side::Buy => committed.buy += order.size,
                        Side::Sell => committed.sell += order.size,
                    }
                }
            }
        }

        const ULP_TOLERANCE: f64 = 1e-9;
        for side in [Side::Buy, Side::Sell] {
            let required = committed.side(side);
            let budget = allocated.side(side);
            if required > budget + ULP_TOLERANCE.max(budget * ULP_TOLERANCE) {
                return Err(CoreError::InsufficientFunds {
                    side,
                    required,
                    available: budget,
                });
            }
        }
        Ok(())
    }

    /// Step 5: broadcast. Transitions REBALANCING -> BROADCASTING.
    pub async fn broadcast(
        &mut self,
        client: &dyn ChainClient,
        actions: Vec<Action>,
    ) -> CoreResult<Vec<BroadcastResult>> {
        self.state = RebalanceState::Broadcasting;
        if actions.is_empty() {
            return Ok(Vec::new());
        }
        client.broadcast_batch(actions).await
    }

    /// Step 6: staleness handling. Call when a fill lands on master
    /// while a rebalance is in flight. Mutates master directly (fills
    /// must never be deferred) and re-syncs the affected slot into the
    /// working grid, marking it stale.
    pub fn apply_fill_during_rebalance(
        &mut self,
        working: &mut WorkingGrid,
        filled_order: Order,
        cause: &str,
    ) -> CoreResult<()> {
        let slot_id = filled_order.id.clone();
        self.grid
            .apply_order_update(filled_order, cause, self.accountant, ApplyOpts::default())?;
        let phase = match self.state {
            RebalanceState::Broadcasting => "broadcasting",
            RebalanceState::Rebalancing => "rebalancing",
            RebalanceState::Normal => "normal",
        };
        working.sync_from_master(&slot_id, self.grid, phase);
        Ok(())
    }

    /// Step 7 + 8: commit or discard, then release. Applies every action
    /// result to master through `apply_order_update` inside one critical
    /// section (single-threaded, so no explicit lock object is needed
    /// beyond this being the only mutator in scope). Refuses a stale
    /// commit outright.
    pub fn commit(
        &mut self,
        working: &WorkingGrid,
        results: &[BroadcastResult],
    ) -> CoreResult<PipelineOutcome> {
        if working.base_version() != self.grid.version() || working.is_stale() {
            let err = CoreError::StaleCommit {
                base_version: working.base_version(),
                master_version: self.grid.version(),
                reason: working
                    .stale_reason()
                    .unwrap_or("base_version diverged from master")
                    .to_string(),
            };
            warn!("{err}");
            audit_event!(AuditCategory::ErrorWarnings, "{}", err);
            self.state = RebalanceState::Normal;
            let CoreError::StaleCommit { reason, .. } = err else { unreachable!() };
            return Ok(PipelineOutcome::DiscardedStale { reason });
        }

        let mut applied = 0usize;
        for result in results {
            match result {
                BroadcastResult::Created { slot_id, chain_order_id } => {
                    if let Some(mut order) = working.get(slot_id).cloned() {
                        order.state = OrderState::Active {
                            chain_order_id: chain_order_id.clone(),
                        };
                        self.grid.apply_order_update(
                            order,
                            "broadcast confirmed",
                            self.accountant,
                            ApplyOpts::default(),
                        )?;
                        applied += 1;
                    }
                }
                BroadcastResult::Acked { slot_id } => {
                    if let Some(order) = working.get(slot_id).cloned() {
                        self.grid.apply_order_update(
                            order,
                            "broadcast acked",
                            self.accountant,
                            ApplyOpts::default(),
                        )?;
                        applied += 1;
                    }
                }
                BroadcastResult::Failed { slot_id, message } => {
                    info!("action for slot {slot_id} failed to broadcast: {message}");
                    audit_event!(
                        AuditCategory::ErrorWarnings,
                        "broadcast failed for {}: {}",
                        slot_id,
                        message
                    );
                }
            }
        }

        self.state = RebalanceState::Normal;
        if applied == 0 {
            return Ok(PipelineOutcome::NoOp);
        }
        Ok(PipelineOutcome::Committed {
            actions_applied: applied,
            new_version: self.grid.version(),
        })
    }

    pub fn release(&mut self) {
        self.state = RebalanceState::Normal;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Order;

    struct MockClient {
        assign_ids: bool,
    }

    #[async_trait]
    impl ChainClient for MockClient {
        async fn broadcast_batch(&self, actions: Vec<Action>) -> CoreResult<Vec<BroadcastResult>> {
            Ok(actions
                .into_iter()
                .map(|a| match a {
                    Action::Create { slot_id, .. } => {
                        if self.assign_ids {
                            BroadcastResult::Created {
                                chain_order_id: format!("1.7.{slot_id}"),
                                slot_id,
                            }
                        } else {
                            BroadcastResult::Failed {
                                slot_id,
                                message: "rejected".into(),
                            }
                        }
                    }
                    Action::Update { slot_id, .. } => BroadcastResult::Acked { slot_id },
                    Action::Cancel { slot_id, .. } => BroadcastResult::Acked { slot_id },
                })
                .collect())
        }
    }

    #[test]
    fn freeze_then_mutate_does_not_touch_master() {
        let mut grid = MasterGrid::new();
        let mut acct = Accountant::new();
        let order = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 10.0);
        grid.apply_order_update(order, "seed", &mut acct, ApplyOpts::default())
            .unwrap();

        let pipeline = CowPipeline::new(&mut grid, &mut acct);
        let mut working = pipeline.freeze();
        let mut mutated = working.get("buy-0").unwrap().clone();
        mutated.size = 42.0;
        working.set(mutated);

        assert_eq!(grid.get("buy-0").unwrap().size, 10.0);
    }

    #[tokio::test]
    async fn full_cycle_places_virtual_order_and_commits() {
        let mut grid = MasterGrid::new();
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 1000.0;
        let order = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 0.0);
        grid.apply_order_update(order, "seed", &mut acct, ApplyOpts::default())
            .unwrap();

        let mut pipeline = CowPipeline::new(&mut grid, &mut acct);
        let mut working = pipeline.freeze();

        let mut targets = HashMap::new();
        targets.insert("buy-0".to_string(), (OrderKind::Buy, 10.0));
        pipeline.plan(&mut working, &targets);

        let actions = pipeline.delta(&working);
        assert_eq!(actions.len(), 1);

        let allocated = AllocatedFunds { buy: 1000.0, sell: 0.0 };
        pipeline.validate_funds(&working, &allocated).unwrap();

        let client = MockClient { assign_ids: true };
        let results = pipeline.broadcast(&client, actions).await.unwrap();

        let outcome = pipeline.commit(&working, &results).unwrap();
        match outcome {
            PipelineOutcome::Committed { actions_applied, .. } => assert_eq!(actions_applied, 1),
            other => panic!("expected commit, got {other:?}"),
        }
        assert!(matches!(
            grid.get("buy-0").unwrap().state,
            OrderState::Active { .. }
        ));
    }

    #[test]
    fn stale_base_version_discards_commit() {
        let mut grid = MasterGrid::new();
        let mut acct = Accountant::new();
        let order = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 10.0);
        grid.apply_order_update(order, "seed", &mut acct, ApplyOpts::default())
            .unwrap();

        let mut pipeline = CowPipeline::new(&mut grid, &mut acct);
        let working = pipeline.freeze();

        // Advance master past the working grid's base_version by
        // applying another mutation before commit.
        let extra = Order::virtual_order("buy-1".into(), 98.0, OrderKind::Buy, 5.0);
        pipeline
            .grid
            .apply_order_update(extra, "concurrent plan", pipeline.accountant, ApplyOpts::default())
            .unwrap();

        let outcome = pipeline.commit(&working, &[]).unwrap();
        assert!(matches!(outcome, PipelineOutcome::DiscardedStale { .. }));
    }
}
