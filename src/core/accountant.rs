//! Fund ledger bookkeeping: optimistic deltas driven by order-state
//! transitions, fill settlement, and the invariant-violation recovery
//! loop.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use log::debug;

use crate::audit_event;
use crate::consts::{
    FEE_DEDUP_CAP, FEE_DEDUP_EVICT_TO, FEE_DEDUP_TTL_SECS, MAX_RECOVERY_ATTEMPTS,
    RECOVERY_DECAY_FALLBACK_MS, RECOVERY_RETRY_INTERVAL_MS,
};

use super::audit::AuditCategory;
use super::errors::{CoreError, CoreResult};
use super::types::{FundLedger, Order, OrderKind, Side};

/// A fill's worth of settlement input, already netted of exchange fees by
/// the caller (fee schedules are a chain-client concern, not the
/// ledger's).
#[derive(Debug, Clone)]
pub struct FillSettlement {
    /// Side of the order that was filled.
    pub side: Side,
    /// Net amount received on the opposite side's asset, after the
    /// maker/taker market fee.
    pub net_receive_amount: f64,
    /// Native-token operation fee incurred placing/filling this order.
    pub operation_fee: f64,
    /// Opaque chain operation id, used for fill deduplication.
    pub chain_operation_id: String,
}

/// Time+capacity bounded dedup table for chain operation ids. No ring or
/// LRU crate in this codebase's dependency tree covers this shape, so the
/// table is a small hand-rolled FIFO: since every entry shares the same
/// TTL, insertion order and expiry order coincide, so a plain deque
/// suffices for eviction.
struct FeeDedup {
    ttl: Duration,
    cap: usize,
    evict_to: f64,
    expires_at: HashMap<String, Instant>,
    order: VecDeque<String>,
}

impl FeeDedup {
    fn new(ttl: Duration, cap: usize, evict_to: f64) -> Self {
        Self {
            ttl,
            cap,
            evict_to,
            expires_at: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn sweep_expired(&mut self, now: Instant) {
        while let Some(front) = self.order.front() {
            match self.expires_at.get(front) {
                Some(exp) if *exp <= now => {
                    let id = self.order.pop_front().unwrap();
                    self.expires_at.remove(&id);
                }
                _ => break,
            }
        }
    }

    /// Records `id` if it hasn't been seen (and not yet expired). Returns
    /// `true` when this is the first time `id` was recorded.
    fn record(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.sweep_expired(now);
        if self.expires_at.contains_key(id) {
            return false;
        }
        self.expires_at.insert(id.to_string(), now + self.ttl);
        self.order.push_back(id.to_string());
        if self.expires_at.len() > self.cap {
            let target = ((self.cap as f64) * self.evict_to) as usize;
            while self.expires_at.len() > target {
                match self.order.pop_front() {
                    Some(old) => {
                        self.expires_at.remove(&old);
                    }
                    None => break,
                }
            }
        }
        true
    }
}

/// Tracks the invariant-violation recovery episode: scheduling, cooldown
/// between attempts, and the hard attempt cap.
#[derive(Default)]
struct RecoveryLoop {
    pending: bool,
    attempts: u32,
    last_attempt: Option<Instant>,
    episode_ended: bool,
}

impl RecoveryLoop {
    /// Mark a recovery as needed. Idempotent; a no-op once the episode
    /// has exhausted its attempt cap (it waits for `reset`).
    fn schedule(&mut self) {
        if !self.episode_ended {
            self.pending = true;
        }
    }

    /// Returns true if a recovery attempt should run now, updating
    /// internal bookkeeping as a side effect.
    fn try_consume(&mut self) -> bool {
        self.decay();
        if !self.pending || self.episode_ended {
            return false;
        }
        let now = Instant::now();
        if let Some(last) = self.last_attempt {
            if now.duration_since(last) < Duration::from_millis(RECOVERY_RETRY_INTERVAL_MS) {
                return false;
            }
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        self.pending = false;
        if self.attempts >= MAX_RECOVERY_ATTEMPTS {
            self.episode_ended = true;
        }
        true
    }

    /// Forgives a stalled episode after a long idle window: if it's been
    /// more than `RECOVERY_DECAY_FALLBACK_MS` since the last attempt (an
    /// exhausted episode that never got a fresh `reset` from a periodic
    /// fetch), the attempt counter decays back to zero so a later
    /// violation gets a fresh run of attempts instead of being stuck
    /// behind the old cap forever.
    fn decay(&mut self) {
        let Some(last) = self.last_attempt else { return };
        if Instant::now().duration_since(last) > Duration::from_millis(RECOVERY_DECAY_FALLBACK_MS) {
            self.attempts = 0;
            self.episode_ended = false;
        }
    }

    fn reset(&mut self) {
        *self = RecoveryLoop::default();
    }
}

/// Per-side asset decimal precision, used for ledger-tolerance and
/// recovery-episode bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct Precision {
    pub buy: u32,
    pub sell: u32,
}

/// Owns the fund ledger and drives its optimistic updates.
pub struct Accountant {
    ledger: FundLedger,
    precision: Precision,
    fee_dedup: FeeDedup,
    recovery: RecoveryLoop,
}

enum Contribution {
    None,
    Committed(f64),
    Virtual(f64),
}

fn side_of(kind: OrderKind) -> Option<Side> {
    match kind {
        OrderKind::Buy => Some(Side::Buy),
        OrderKind::Sell => Some(Side::Sell),
        OrderKind::Spread => None,
    }
}

fn contribution(order: &Order) -> Contribution {
    if order.kind.is_spread() {
        return Contribution::None;
    }
    if order.state.is_on_chain() {
        Contribution::Committed(order.size)
    } else {
        Contribution::Virtual(order.size)
    }
}

impl Accountant {
    pub fn new() -> Self {
        Self {
            ledger: FundLedger::default(),
            precision: Precision::default(),
            fee_dedup: FeeDedup::new(
                Duration::from_secs(FEE_DEDUP_TTL_SECS),
                FEE_DEDUP_CAP,
                FEE_DEDUP_EVICT_TO,
            ),
            recovery: RecoveryLoop::default(),
        }
    }

    pub fn with_precision(precision: Precision) -> Self {
        Self {
            precision,
            ..Self::new()
        }
    }

    pub fn ledger(&self) -> &FundLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut FundLedger {
        &mut self.ledger
    }

    pub fn precision(&self, side: Side) -> u32 {
        match side {
            Side::Buy => self.precision.buy,
            Side::Sell => self.precision.sell,
        }
    }

    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    /// Replace the entire account-totals snapshot (chain totals) for
    /// `side`, as done by the recovery loop and by periodic balance
    /// refreshes. Committed/virtual figures are left untouched; callers
    /// doing a full re-fetch reset those separately via `reset_funds`.
    pub fn set_account_totals(&mut self, side: Side, total: f64, free: f64) {
        let ledger = self.ledger.side_mut(side);
        ledger.totals.total = total;
        ledger.totals.free = free;
    }

    /// Wipe the committed/virtual/cache figures for `side` ahead of a
    /// from-scratch rebuild off ground truth (recovery path).
    pub fn reset_funds(&mut self, side: Side) {
        let ledger = self.ledger.side_mut(side);
        ledger.funds.committed_chain = 0.0;
        ledger.funds.committed_grid = 0.0;
        ledger.funds.virtual_ = 0.0;
    }

    fn remove_contribution(&mut self, order: &Order) {
        let Some(side) = side_of(order.kind) else {
            return;
        };
        let ledger = self.ledger.side_mut(side);
        match contribution(order) {
            Contribution::Committed(size) => {
                ledger.totals.free += size;
                ledger.funds.committed_chain -= size;
                ledger.funds.committed_grid -= size;
            }
            Contribution::Virtual(size) => {
                ledger.funds.virtual_ -= size;
            }
            Contribution::None => {}
        }
    }

    fn add_contribution(&mut self, order: &Order) {
        let Some(side) = side_of(order.kind) else {
            return;
        };
        let ledger = self.ledger.side_mut(side);
        match contribution(order) {
            Contribution::Committed(size) => {
                ledger.totals.free -= size;
                ledger.funds.committed_chain += size;
                ledger.funds.committed_grid += size;
            }
            Contribution::Virtual(size) => {
                ledger.funds.virtual_ += size;
            }
            Contribution::None => {}
        }
    }

    /// Called synchronously from `MasterGrid::apply_order_update`.
    /// Undoes whatever the old order contributed to its side's ledger and
    /// applies what the new order contributes to its own side's ledger.
    /// A kind change (rotation) falls out of this naturally: the old
    /// side is credited back and the new side is debited, with no
    /// special-cased rotation branch. This also subsumes the "PARTIAL
    /// reaching chain with a newly-assigned id vs already on chain"
    /// distinction the prototype needed: since `OrderState::Partial`
    /// always carries a `chain_order_id` by construction, the only
    /// virtual-to-onchain transition left is VIRTUAL -> ACTIVE/PARTIAL,
    /// handled uniformly below.
    pub fn on_order_update(&mut self, old_order: Option<&Order>, new_order: &Order, cause: &str) {
        if let Some(old) = old_order {
            self.remove_contribution(old);
        }
        self.add_contribution(new_order);

        audit_event!(
            AuditCategory::FundChanges,
            "slot={} cause={} kind={:?}",
            new_order.id,
            cause,
            new_order.kind
        );
    }

    /// `processFill`: credit net proceeds to the opposite side's cache
    /// funds, accumulate the native fee, lazily settle it, and dedupe by
    /// chain operation id. The caller is responsible for separately
    /// transitioning the filled order's state via `apply_order_update`.
    pub fn process_fill(&mut self, fill: FillSettlement) -> CoreResult<()> {
        if !self.fee_dedup.record(&fill.chain_operation_id) {
            debug!("duplicate fill operation {}, ignoring", fill.chain_operation_id);
            return Err(CoreError::DuplicateFill(fill.chain_operation_id));
        }

        let opposite = fill.side.opposite();
        self.ledger.side_mut(opposite).funds.cache_funds += fill.net_receive_amount;
        self.ledger.side_mut(fill.side).funds.bts_fees_owed += fill.operation_fee;

        audit_event!(
            AuditCategory::FillEvents,
            "side={:?} op={} net_receive={} fee={}",
            fill.side,
            fill.chain_operation_id,
            fill.net_receive_amount,
            fill.operation_fee
        );

        self.settle_bts_fees(fill.side);
        Ok(())
    }

    /// Lazily settles accrued native fees against free balance and cache
    /// funds, deferring if free balance can't cover the full amount yet.
    pub fn settle_bts_fees(&mut self, side: Side) {
        let ledger = self.ledger.side_mut(side);
        let owed = ledger.funds.bts_fees_owed;
        if owed <= 0.0 {
            return;
        }
        if ledger.totals.free >= owed {
            ledger.totals.free -= owed;
            let drained = owed.min(ledger.funds.cache_funds);
            ledger.funds.cache_funds -= drained;
            ledger.funds.bts_fees_owed = 0.0;
        }
    }

    /// Flags that an invariant check failed and a recovery pass is
    /// needed. Idempotent within an active episode.
    pub fn schedule_recovery(&mut self) {
        self.recovery.schedule();
    }

    pub fn recovery_scheduled(&self) -> bool {
        self.recovery.pending
    }

    /// `attemptFundRecovery`: returns true when the caller should run a
    /// full re-fetch of chain totals + open orders now (with
    /// `skip_accounting = true` on the replay), honoring the cooldown
    /// between attempts and the hard attempt cap.
    pub fn attempt_fund_recovery(&mut self) -> bool {
        self.recovery.try_consume()
    }

    /// Resets the recovery episode, called when a fresh periodic balance
    /// fetch succeeds independent of any violation.
    pub fn reset_recovery_episode(&mut self) {
        self.recovery.reset();
    }
}

impl Default for Accountant {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Order, OrderKind, OrderState};

    #[test]
    fn virtual_to_active_deducts_full_size_from_free() {
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 100.0;
        let old = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 10.0);
        let new = Order {
            state: OrderState::Active {
                chain_order_id: "1.7.1".into(),
            },
            size: 10.0,
            ..old.clone()
        };
        acct.on_order_update(Some(&old), &new, "broadcast confirmed");
        assert_eq!(acct.ledger().buy.totals.free, 90.0);
        assert_eq!(acct.ledger().buy.funds.committed_chain, 10.0);
        assert_eq!(acct.ledger().buy.funds.virtual_, 0.0);
    }

    #[test]
    fn active_resize_deducts_only_the_increase() {
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 100.0;
        acct.ledger_mut().buy.funds.committed_chain = 10.0;
        acct.ledger_mut().buy.funds.committed_grid = 10.0;

        let old = Order {
            id: "buy-0".into(),
            price: 99.0,
            kind: OrderKind::Buy,
            state: OrderState::Active {
                chain_order_id: "1.7.1".into(),
            },
            size: 10.0,
            ideal_size: 10.0,
            raw_on_chain: None,
        };
        let new = Order {
            size: 14.0,
            ..old.clone()
        };
        acct.on_order_update(Some(&old), &new, "update");
        assert_eq!(acct.ledger().buy.totals.free, 96.0);
        assert_eq!(acct.ledger().buy.funds.committed_chain, 14.0);
    }

    #[test]
    fn fill_releases_full_committed_size_to_free() {
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 90.0;
        acct.ledger_mut().buy.funds.committed_chain = 10.0;
        acct.ledger_mut().buy.funds.committed_grid = 10.0;

        let old = Order {
            id: "buy-0".into(),
            price: 99.0,
            kind: OrderKind::Buy,
            state: OrderState::Active {
                chain_order_id: "1.7.1".into(),
            },
            size: 10.0,
            ideal_size: 10.0,
            raw_on_chain: None,
        };
        let new = Order::spread("buy-0".into(), 99.0);
        acct.on_order_update(Some(&old), &new, "fully filled");
        assert_eq!(acct.ledger().buy.totals.free, 100.0);
        assert_eq!(acct.ledger().buy.funds.committed_chain, 0.0);
    }

    #[test]
    fn rotation_moves_capital_between_sides() {
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 100.0;
        acct.ledger_mut().buy.funds.committed_chain = 10.0;
        acct.ledger_mut().buy.funds.committed_grid = 10.0;
        acct.ledger_mut().sell.totals.free = 100.0;

        let old = Order {
            id: "slot-0".into(),
            price: 99.0,
            kind: OrderKind::Buy,
            state: OrderState::Active {
                chain_order_id: "1.7.1".into(),
            },
            size: 10.0,
            ideal_size: 10.0,
            raw_on_chain: None,
        };
        let new = Order::virtual_order("slot-0".into(), 101.0, OrderKind::Sell, 5.0);
        acct.on_order_update(Some(&old), &new, "rotate");

        assert_eq!(acct.ledger().buy.totals.free, 110.0);
        assert_eq!(acct.ledger().buy.funds.committed_chain, 0.0);
        assert_eq!(acct.ledger().sell.funds.virtual_, 5.0);
    }

    #[test]
    fn duplicate_fill_operation_is_rejected() {
        let mut acct = Accountant::new();
        let fill = FillSettlement {
            side: Side::Buy,
            net_receive_amount: 1.0,
            operation_fee: 0.01,
            chain_operation_id: "op-1".into(),
        };
        assert!(acct.process_fill(fill.clone()).is_ok());
        assert!(matches!(
            acct.process_fill(fill.clone()),
            Err(CoreError::DuplicateFill(_))
        ));
    }

    #[test]
    fn settle_defers_when_free_insufficient() {
        let mut acct = Accountant::new();
        acct.ledger_mut().buy.totals.free = 1.0;
        acct.ledger_mut().buy.funds.bts_fees_owed = 5.0;
        acct.settle_bts_fees(Side::Buy);
        assert_eq!(acct.ledger().buy.funds.bts_fees_owed, 5.0);

        acct.ledger_mut().buy.totals.free = 10.0;
        acct.ledger_mut().buy.funds.cache_funds = 3.0;
        acct.settle_bts_fees(Side::Buy);
        assert_eq!(acct.ledger().buy.funds.bts_fees_owed, 0.0);
        assert_eq!(acct.ledger().buy.totals.free, 5.0);
        assert_eq!(acct.ledger().buy.funds.cache_funds, 0.0);
    }

    #[test]
    fn recovery_first_attempt_is_immediate_then_cooldown_applies() {
        let mut acct = Accountant::new();
        acct.schedule_recovery();
        assert!(acct.attempt_fund_recovery());
        acct.schedule_recovery();
        // Cooldown has not elapsed yet.
        assert!(!acct.attempt_fund_recovery());
    }

    #[test]
    fn exhausted_episode_decays_after_a_long_idle_window() {
        let mut loop_ = RecoveryLoop {
            pending: true,
            attempts: MAX_RECOVERY_ATTEMPTS,
            last_attempt: Instant::now().checked_sub(Duration::from_millis(RECOVERY_DECAY_FALLBACK_MS + 1)),
            episode_ended: true,
        };
        assert!(loop_.try_consume(), "decay should forgive the episode and let a fresh attempt run");
        assert_eq!(loop_.attempts, 1, "attempt count restarts from zero, then this call consumes one");
        assert!(!loop_.episode_ended);
    }

    #[test]
    fn fresh_episode_does_not_decay() {
        let mut loop_ = RecoveryLoop {
            pending: true,
            attempts: 2,
            last_attempt: Instant::now().checked_sub(Duration::from_millis(1)),
            episode_ended: false,
        };
        loop_.try_consume();
        assert_eq!(loop_.attempts, 3, "recent attempt history must not be wiped by decay");
    }
}
