//! Shared bot state plus the control surface exposed to callers: start,
//! stop, pause/resume fund recalculation, force a resync, dump a
//! snapshot, and read back the audit log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::chain::ChainDataSource;
use crate::core::audit::AuditCategory;
use crate::core::errors::CoreResult;
use crate::core::sync::{ChainOrder, SnapshotSyncResult};
use crate::core::types::{OrderStateTag, Side};
use crate::core::{Accountant, MasterGrid, SlotLeases, SyncEngine};
use crate::persistence::{GridPersistence, GridSnapshot};

/// Everything one cooperative cycle of the bot touches under a single
/// lock: the master grid, its accountant, and the per-slot lease table.
/// A single mutex (rather than the teacher's bare `RwLock`) is used
/// because commit must serialize with fills, not merely with other
/// readers.
pub struct CoreState {
    pub grid: MasterGrid,
    pub accountant: Accountant,
    pub leases: SlotLeases,
}

impl CoreState {
    pub fn new(grid: MasterGrid, accountant: Accountant, leases: SlotLeases) -> Self {
        Self {
            grid,
            accountant,
            leases,
        }
    }
}

/// Summary returned by the status endpoint / `dump_snapshot`'s sibling.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub bot_id: String,
    pub running: bool,
    pub grid_version: u64,
    pub order_count: usize,
    pub virtual_count: usize,
    pub active_count: usize,
    pub partial_count: usize,
    pub fund_recalc_paused: bool,
    pub recovery_scheduled: bool,
    pub buy_available: f64,
    pub sell_available: f64,
}

/// The control surface: every external entry point into the bot that
/// isn't part of the cycle loop itself. Cloneable — every clone shares
/// the same underlying state and flags.
pub struct BotControl<C, P> {
    bot_id: String,
    state: Arc<Mutex<CoreState>>,
    chain: Arc<C>,
    persistence: Arc<P>,
    running: Arc<AtomicBool>,
    /// Nested counted guard: pausing is a stack, not a flag, so two
    /// independent callers pausing concurrently don't unpause each
    /// other's window early.
    fund_recalc_pause_depth: Arc<Mutex<u32>>,
}

// Implemented by hand rather than derived: a derived `Clone` would bound
// `C: Clone, P: Clone`, but every field here is already an `Arc` and
// clones without either the chain client or the persistence store
// themselves being `Clone`.
impl<C, P> Clone for BotControl<C, P> {
    fn clone(&self) -> Self {
        Self {
            bot_id: self.bot_id.clone(),
            state: Arc::clone(&self.state),
            chain: Arc::clone(&self.chain),
            persistence: Arc::clone(&self.persistence),
            running: Arc::clone(&self.running),
            fund_recalc_pause_depth: Arc::clone(&self.fund_recalc_pause_depth),
        }
    }
}

impl<C, P> BotControl<C, P>
where
    C: ChainDataSource + Send + Sync + 'static,
    P: GridPersistence + Send + Sync + 'static,
{
    pub fn new(bot_id: impl Into<String>, state: Arc<Mutex<CoreState>>, chain: Arc<C>, persistence: Arc<P>) -> Self {
        Self {
            bot_id: bot_id.into(),
            state,
            chain,
            persistence,
            running: Arc::new(AtomicBool::new(false)),
            fund_recalc_pause_depth: Arc::new(Mutex::new(0)),
        }
    }

    pub fn state(&self) -> Arc<Mutex<CoreState>> {
        Arc::clone(&self.state)
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks the bot running. Returns `false` if it was already running
    /// (idempotent, not an error).
    pub fn start(&self) -> bool {
        let was_running = self.running.swap(true, Ordering::SeqCst);
        if !was_running {
            info!("bot {} started", self.bot_id);
        }
        !was_running
    }

    /// Marks the bot stopped. The cycle loop observes this flag between
    /// iterations and exits cleanly rather than mid-pipeline.
    pub fn stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        if was_running {
            info!("bot {} stopped", self.bot_id);
        }
        was_running
    }

    /// Pushes one level of fund-recalculation suppression. Returns the
    /// new depth.
    pub async fn pause_fund_recalc(&self) -> u32 {
        let mut depth = self.fund_recalc_pause_depth.lock().await;
        *depth += 1;
        *depth
    }

    /// Pops one level. Saturates at zero rather than going negative on an
    /// unbalanced call.
    pub async fn resume_fund_recalc(&self) -> u32 {
        let mut depth = self.fund_recalc_pause_depth.lock().await;
        *depth = depth.saturating_sub(1);
        *depth
    }

    pub async fn fund_recalc_paused(&self) -> bool {
        *self.fund_recalc_pause_depth.lock().await > 0
    }

    /// Re-fetches open orders from the chain and runs them through the
    /// sync engine, skipping accounting deltas (the replay rebuilds the
    /// ledger from ground truth instead of layering optimistic deltas on
    /// top of it). Used both by the control surface and by the runner's
    /// own recovery path.
    pub async fn force_resync(&self, account_id: &str, sync: &SyncEngine) -> CoreResult<SnapshotSyncResult> {
        let chain_orders: Vec<ChainOrder> = self
            .chain
            .get_open_orders(account_id)
            .await
            .map_err(|e| crate::core::errors::CoreError::ChainTransient(e.to_string()))?;

        let mut guard = self.state.lock().await;
        let CoreState { grid, accountant, .. } = &mut *guard;
        let result = sync.sync_from_open_orders(grid, accountant, &chain_orders).await?;
        accountant.reset_recovery_episode();
        Ok(result)
    }

    /// Snapshots the current grid for persistence or inspection.
    pub async fn dump_snapshot(&self) -> GridSnapshot {
        let guard = self.state.lock().await;
        GridSnapshot {
            orders: guard.grid.iter().cloned().collect(),
            version: guard.grid.version(),
        }
    }

    /// Persists the current grid and fund ledger through the configured
    /// store.
    pub async fn persist(&self) -> Result<(), crate::errors::Error> {
        let snapshot = self.dump_snapshot().await;
        let ledger = {
            let guard = self.state.lock().await;
            *guard.accountant.ledger()
        };
        self.persistence.write_grid(&self.bot_id, &snapshot).await?;
        self.persistence.write_cache_funds(&self.bot_id, &ledger).await
    }

    pub async fn status(&self) -> StatusSummary {
        let guard = self.state.lock().await;
        StatusSummary {
            bot_id: self.bot_id.clone(),
            running: self.is_running(),
            grid_version: guard.grid.version(),
            order_count: guard.grid.len(),
            virtual_count: guard.grid.slots_by_state(OrderStateTag::Virtual).count(),
            active_count: guard.grid.slots_by_state(OrderStateTag::Active).count(),
            partial_count: guard.grid.slots_by_state(OrderStateTag::Partial).count(),
            fund_recalc_paused: *self.fund_recalc_pause_depth.lock().await > 0,
            recovery_scheduled: guard.accountant.recovery_scheduled(),
            buy_available: guard.accountant.ledger().side(Side::Buy).available(),
            sell_available: guard.accountant.ledger().side(Side::Sell).available(),
        }
    }

    /// Recent audit ring entries, newest last, serialized for the
    /// `/api/audit` endpoint.
    pub async fn audit_log(&self) -> Vec<crate::core::audit::AuditEntry> {
        let guard = self.state.lock().await;
        guard.grid.audit_entries().cloned().collect()
    }

    /// Emits one structured audit line under `category`'s log target,
    /// for callers outside the core that need to record something
    /// against the same stream (e.g. a manual operator action).
    pub fn emit_audit_log(&self, category: AuditCategory, message: &str) {
        log::info!(target: category.log_target(), "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::core::{Accountant, MasterGrid, SlotLeases};
    use crate::persistence::FilePersistence;
    use std::time::Duration;

    fn control() -> BotControl<MockChainClient, FilePersistence> {
        let state = Arc::new(Mutex::new(CoreState::new(
            MasterGrid::new(),
            Accountant::new(),
            SlotLeases::new(Duration::from_secs(10)),
        )));
        BotControl::new(
            "test-bot",
            state,
            Arc::new(MockChainClient::new()),
            Arc::new(FilePersistence::new(std::env::temp_dir())),
        )
    }

    #[tokio::test]
    async fn start_stop_toggle_running_flag() {
        let ctl = control();
        assert!(!ctl.is_running());
        assert!(ctl.start());
        assert!(ctl.is_running());
        assert!(!ctl.start(), "second start is a no-op, not an error");
        assert!(ctl.stop());
        assert!(!ctl.is_running());
    }

    #[tokio::test]
    async fn pause_resume_is_nested_not_a_flag() {
        let ctl = control();
        assert_eq!(ctl.pause_fund_recalc().await, 1);
        assert_eq!(ctl.pause_fund_recalc().await, 2);
        assert!(ctl.fund_recalc_paused().await);
        assert_eq!(ctl.resume_fund_recalc().await, 1);
        assert!(ctl.fund_recalc_paused().await);
        assert_eq!(ctl.resume_fund_recalc().await, 0);
        assert!(!ctl.fund_recalc_paused().await);
    }

    #[tokio::test]
    async fn resume_without_pause_saturates_at_zero() {
        let ctl = control();
        assert_eq!(ctl.resume_fund_recalc().await, 0);
    }

    #[tokio::test]
    async fn status_reflects_empty_grid() {
        let ctl = control();
        let status = ctl.status().await;
        assert_eq!(status.order_count, 0);
        assert!(!status.recovery_scheduled);
    }
}
