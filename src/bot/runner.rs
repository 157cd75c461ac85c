//! Runner: the bot's cooperative cycle loop. One iteration drains queued
//! fills, syncs chain truth into the master grid, runs the strategy
//! against a frozen working grid, and broadcasts+commits the resulting
//! delta through the COW pipeline.

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::Instant;

use crate::audit_event;
use crate::chain::{ChainDataSource, FeeSchedule};
use crate::consts::PIPELINE_TIMEOUT_MS;
use crate::core::audit::AuditCategory;
use crate::core::pipeline::{AllocatedFunds, ChainClient, CowPipeline, PipelineOutcome};
use crate::core::strategy::{self, FillEvent, PlannedAction, PlannedStep};
use crate::core::sync::{ChainOrder, FeeRates, FillOp, SnapshotSyncResult};
use crate::core::types::{OrderKind, Side, SlotId};
use crate::core::SyncEngine;
use crate::persistence::GridPersistence;

fn to_fee_rates(schedule: &FeeSchedule) -> FeeRates {
    FeeRates {
        market_fee_percent: schedule.market_fee_percent,
        taker_fee_percent: schedule.taker_fee_percent,
        maker_fee_percent: schedule.maker_fee_percent,
        update_fee: schedule.update_fee,
        cancel_fee: schedule.cancel_fee,
    }
}

use super::control::BotControl;

/// Batch size for applying queued fill-history events in one cycle,
/// keyed by how deep the queue has gotten: a backlog is worked off
/// faster, but a single cycle never tries to reconcile an unbounded
/// number of fills atomically.
fn fill_batch_size(queue_depth: usize) -> usize {
    match queue_depth {
        0..=2 => 1,
        3..=5 => 2,
        6..=14 => 3,
        _ => 4,
    }
}

/// Grid-geometry and fund-allocation inputs the runner needs each cycle,
/// alongside the account identity used for chain calls.
pub struct RunnerConfig {
    pub account_id: String,
    pub min_order_size: f64,
    pub weight_buy: f64,
    pub weight_sell: f64,
    pub reaction_cap: u32,
    pub tolerance: f64,
    pub cycle_interval: Duration,
}

/// Drives the cycle loop for one bot instance. Generic over the chain
/// client and persistence store so tests can swap in `MockChainClient`
/// and an in-memory/temp-dir `FilePersistence`.
pub struct Runner<C, P> {
    control: BotControl<C, P>,
    chain: std::sync::Arc<C>,
    sync: SyncEngine,
    config: RunnerConfig,
    fill_queue: Vec<FillOp>,
    fill_cursor: Option<String>,
}

impl<C, P> Runner<C, P>
where
    C: ChainDataSource + ChainClient + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    pub fn new(control: BotControl<C, P>, chain: std::sync::Arc<C>, sync: SyncEngine, config: RunnerConfig) -> Self {
        Self {
            control,
            chain,
            sync,
            config,
            fill_queue: Vec::new(),
            fill_cursor: None,
        }
    }

    /// Runs cycles until `BotControl::stop` flips the running flag.
    /// Intended to be spawned as its own task; returns once stopped.
    pub async fn run(&mut self) {
        while self.control.is_running() {
            if let Err(e) = self.run_cycle().await {
                error!("cycle failed: {e}");
                audit_event!(AuditCategory::ErrorWarnings, "cycle failed: {}", e);
            }
            tokio::time::sleep(self.config.cycle_interval).await;
        }
    }

    /// One full cycle: pull fresh fills, drain a batch of them, pull the
    /// open-orders snapshot (unless fund recalc is paused), plan against
    /// the current ledger, and broadcast+commit the delta. Returns the
    /// pipeline outcome so callers (and tests) can assert on it directly.
    pub async fn run_cycle(&mut self) -> crate::core::errors::CoreResult<PipelineOutcome> {
        let cycle_start = Instant::now();

        self.pull_fill_history().await?;
        self.drain_fill_batch().await;

        if !self.control.fund_recalc_paused().await {
            self.pull_open_orders_snapshot().await?;
        }

        let outcome = self.rebalance(cycle_start).await?;

        if let PipelineOutcome::Committed { .. } = &outcome {
            if let Err(e) = self.control.persist().await {
                warn!("failed to persist grid after commit: {e}");
            }
        }

        self.maybe_recover().await?;
        Ok(outcome)
    }

    async fn pull_fill_history(&mut self) -> crate::core::errors::CoreResult<()> {
        let fills = self
            .chain
            .get_fill_history(&self.config.account_id, self.fill_cursor.as_deref())
            .await
            .map_err(|e| crate::core::errors::CoreError::ChainTransient(e.to_string()))?;
        if let Some(last) = fills.last() {
            self.fill_cursor = Some(last.id.clone());
        }
        self.fill_queue.extend(fills);
        Ok(())
    }

    /// Applies as many queued fills as `fill_batch_size` allows for the
    /// current queue depth, atomically within this cycle.
    async fn drain_fill_batch(&mut self) {
        let batch = fill_batch_size(self.fill_queue.len()).min(self.fill_queue.len());
        let to_process: Vec<FillOp> = self.fill_queue.drain(..batch).collect();
        if to_process.is_empty() {
            return;
        }

        let fee_rates = match self.chain.get_fee_schedule().await {
            Ok(schedule) => to_fee_rates(&schedule),
            Err(e) => {
                warn!("failed to fetch fee schedule, settling fills with zero fees: {e}");
                FeeRates::default()
            }
        };

        let state = self.control.state();
        let mut guard = state.lock().await;
        for fill in &to_process {
            let slot_side = guard
                .grid
                .find_by_chain_order_id(&fill.order_id)
                .map(|o| o.kind);
            match self.sync.sync_from_fill_history(
                &mut guard.grid,
                &mut guard.accountant,
                fill,
                self.config.min_order_size,
                &fee_rates,
            ) {
                Ok(()) => {
                    if let Some(kind) = slot_side {
                        audit_event!(AuditCategory::FillEvents, "applied fill {} on {:?}", fill.id, kind);
                    }
                }
                Err(e) => warn!("failed to apply fill {}: {e}", fill.id),
            }
        }
    }

    async fn pull_open_orders_snapshot(&mut self) -> crate::core::errors::CoreResult<()> {
        let chain_orders: Vec<ChainOrder> = self
            .chain
            .get_open_orders(&self.config.account_id)
            .await
            .map_err(|e| crate::core::errors::CoreError::ChainTransient(e.to_string()))?;

        let state = self.control.state();
        let mut guard = state.lock().await;
        let result: SnapshotSyncResult = self
            .sync
            .sync_from_open_orders(&mut guard.grid, &mut guard.accountant, &chain_orders)
            .await?;

        if !result.orders_needing_correction.is_empty() {
            audit_event!(
                AuditCategory::EdgeCases,
                "{} chain orders need correction after snapshot sync",
                result.orders_needing_correction.len()
            );
        }
        Ok(())
    }

    /// Runs the strategy planner against a frozen working grid and
    /// drives it through the COW pipeline. Honors `PIPELINE_TIMEOUT_MS`:
    /// if the freeze-to-broadcast window runs long, the working grid is
    /// discarded rather than pushed through as a stale broadcast, and the
    /// next cycle's snapshot sync picks the state back up.
    async fn rebalance(&mut self, cycle_start: Instant) -> crate::core::errors::CoreResult<PipelineOutcome> {
        let state = self.control.state();
        let mut guard = state.lock().await;

        let allocated = AllocatedFunds {
            buy: allocated_for(&guard.accountant, Side::Buy),
            sell: allocated_for(&guard.accountant, Side::Sell),
        };

        let targets = self.plan_targets(&guard.grid, &allocated);

        let mut pipeline = CowPipeline::new(&mut guard.grid, &mut guard.accountant);
        let mut working = pipeline.freeze();
        pipeline.plan(&mut working, &targets);
        let actions = pipeline.delta(&working);

        if actions.is_empty() {
            pipeline.release();
            return Ok(PipelineOutcome::NoOp);
        }

        pipeline.validate_funds(&working, &allocated)?;

        if cycle_start.elapsed() > Duration::from_millis(PIPELINE_TIMEOUT_MS) {
            warn!("pipeline timeout exceeded before broadcast, forcing maintenance resync next cycle");
            audit_event!(AuditCategory::ErrorWarnings, "pipeline timeout exceeded, discarding working grid");
            pipeline.release();
            return Ok(PipelineOutcome::DiscardedStale {
                reason: "pipeline timeout".into(),
            });
        }

        let results = pipeline.broadcast(self.chain.as_ref(), actions).await?;
        pipeline.commit(&working, &results)
    }

    /// Phase A-C strategy planning, boiled down to a per-slot target
    /// size/kind map the pipeline's `plan` step projects onto the
    /// working grid. The reaction cap is one shared budget for the whole
    /// cycle, so both sides' steps are planned first and only capped once
    /// they're combined.
    fn plan_targets(
        &self,
        grid: &crate::core::MasterGrid,
        allocated: &AllocatedFunds,
    ) -> HashMap<SlotId, (OrderKind, f64)> {
        let mut all_steps: Vec<PlannedStep> = Vec::new();

        for (kind, weight, budget) in [
            (OrderKind::Buy, self.config.weight_buy, allocated.buy),
            (OrderKind::Sell, self.config.weight_sell, allocated.sell),
        ] {
            let topology = grid.slots_by_kind(kind).cloned().collect::<Vec<_>>();
            let sizes = strategy::plan_side_sizing(&topology, budget, weight);
            let steps = strategy::plan_roles(grid, &sizes, self.config.tolerance, self.config.min_order_size);
            let rotated = strategy::plan_rotations(steps, grid);
            all_steps.extend(rotated);
        }

        let capped = strategy::enforce_reaction_cap(all_steps, self.config.reaction_cap);

        let mut targets = HashMap::new();
        for (slot_id, action) in capped {
            let Some(kind) = grid.get(&slot_id).map(|o| o.kind) else {
                continue;
            };
            match action {
                PlannedAction::Keep => continue,
                PlannedAction::Cancel => {
                    targets.insert(slot_id, (kind, 0.0));
                }
                PlannedAction::Update { size } | PlannedAction::Place { size } | PlannedAction::Rotate { size, .. } => {
                    targets.insert(slot_id, (kind, size));
                }
                PlannedAction::Split { excess_slot, excess_size, size } => {
                    if let Some(excess_kind) = grid.get(&excess_slot).map(|o| o.kind) {
                        targets.insert(excess_slot, (excess_kind, excess_size));
                    }
                    targets.insert(slot_id, (kind, size));
                }
            }
        }

        targets
    }

    /// Drives the accountant's recovery loop if the last cycle scheduled
    /// one: re-fetches account totals and rebuilds the ledger from
    /// ground truth rather than layering another optimistic delta on top
    /// of a possibly-corrupt one.
    async fn maybe_recover(&mut self) -> crate::core::errors::CoreResult<()> {
        let should_run = {
            let state = self.control.state();
            let mut guard = state.lock().await;
            if !guard.accountant.recovery_scheduled() {
                return Ok(());
            }
            guard.accountant.attempt_fund_recovery()
        };
        if !should_run {
            return Ok(());
        }

        info!("running fund recovery pass");
        let balances = self
            .chain
            .get_account_totals(&self.config.account_id)
            .await
            .map_err(|e| crate::core::errors::CoreError::ChainTransient(e.to_string()))?;

        let state = self.control.state();
        let mut guard = state.lock().await;
        guard.accountant.reset_funds(Side::Buy);
        guard.accountant.reset_funds(Side::Sell);
        guard
            .accountant
            .set_account_totals(Side::Buy, balances.quote.total, balances.quote.free);
        guard
            .accountant
            .set_account_totals(Side::Sell, balances.base.total, balances.base.free);

        audit_event!(AuditCategory::ErrorWarnings, "fund recovery pass completed");
        Ok(())
    }

    /// Recovers the spread boundary from the current grid view (cold
    /// start or post-recovery).
    pub fn recovered_boundary(grid: &crate::core::MasterGrid, start_index: i64) -> i64 {
        strategy::recover_boundary(grid, start_index)
    }

    /// Folds the boundary crawl over a batch of just-applied fills.
    pub fn crawl_boundary(current_boundary: i64, sides: &[Side]) -> i64 {
        let fills: Vec<FillEvent> = sides.iter().map(|side| FillEvent { side: *side }).collect();
        strategy::plan_boundary_crawl(current_boundary, &fills)
    }
}

/// Per-side allocated budget per §4.4: free + committed + cache funds.
fn allocated_for(accountant: &crate::core::Accountant, side: Side) -> f64 {
    let ledger = accountant.ledger().side(side);
    ledger.available() + ledger.funds.committed_grid + ledger.funds.cache_funds
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_batch_size_thresholds_match_spec() {
        assert_eq!(fill_batch_size(0), 1);
        assert_eq!(fill_batch_size(2), 1);
        assert_eq!(fill_batch_size(3), 2);
        assert_eq!(fill_batch_size(5), 2);
        assert_eq!(fill_batch_size(6), 3);
        assert_eq!(fill_batch_size(14), 3);
        assert_eq!(fill_batch_size(15), 4);
        assert_eq!(fill_batch_size(100), 4);
    }
}
