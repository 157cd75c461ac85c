//! Core data types for the order manager: slots, orders, fund ledgers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Opaque, stable identifier for a grid position. Its price is fixed at
/// grid creation; only the order occupying it changes over time.
pub type SlotId = String;

/// Opaque chain-assigned order identifier.
pub type ChainOrderId = String;

/// Which side of the grid a slot belongs to, or whether it sits in the
/// bid-ask gap carrying no capital.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Buy,
    Sell,
    Spread,
}

impl OrderKind {
    pub fn opposite(&self) -> Self {
        match self {
            OrderKind::Buy => OrderKind::Sell,
            OrderKind::Sell => OrderKind::Buy,
            OrderKind::Spread => OrderKind::Spread,
        }
    }

    pub fn is_spread(&self) -> bool {
        matches!(self, OrderKind::Spread)
    }
}

/// Lifecycle state of a slot's order. `chain_order_id` is carried by the
/// `Active`/`Partial` variants themselves, which makes the spec's runtime
/// invariant "`chainOrderId == null` iff `state == VIRTUAL`" a property of
/// the type rather than something that must be checked at every call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderState {
    Virtual,
    Active { chain_order_id: ChainOrderId },
    Partial { chain_order_id: ChainOrderId },
}

impl OrderState {
    pub fn chain_order_id(&self) -> Option<&ChainOrderId> {
        match self {
            OrderState::Virtual => None,
            OrderState::Active { chain_order_id } | OrderState::Partial { chain_order_id } => {
                Some(chain_order_id)
            }
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, OrderState::Virtual)
    }

    pub fn is_on_chain(&self) -> bool {
        !self.is_virtual()
    }

    pub fn tag(&self) -> OrderStateTag {
        match self {
            OrderState::Virtual => OrderStateTag::Virtual,
            OrderState::Active { .. } => OrderStateTag::Active,
            OrderState::Partial { .. } => OrderStateTag::Partial,
        }
    }
}

/// State without its payload, used as an index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStateTag {
    Virtual,
    Active,
    Partial,
}

/// Snapshot of the last chain view of an order, kept for authoritative
/// size recovery when the local model is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOnChain {
    pub chain_order_id: ChainOrderId,
    pub for_sale: f64,
    pub price: f64,
}

/// One grid position: a fixed price with a movable order on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: SlotId,
    pub price: f64,
    pub kind: OrderKind,
    pub state: OrderState,
    pub size: f64,
    /// Size the strategy targeted when this slot was last placed/updated;
    /// used for dust and restore thresholds.
    pub ideal_size: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_on_chain: Option<RawOnChain>,
}

impl Order {
    pub fn spread(id: SlotId, price: f64) -> Self {
        Self {
            id,
            price,
            kind: OrderKind::Spread,
            state: OrderState::Virtual,
            size: 0.0,
            ideal_size: 0.0,
            raw_on_chain: None,
        }
    }

    /// A planned-but-not-placed order. `size` is the target the strategy
    /// wants placed next broadcast; it is non-zero exactly when there is
    /// a plan to place something here (an untouched slot uses `size =
    /// 0.0`). `ideal_size` starts equal to `size` and stays frozen once
    /// the order is actually placed, so later PARTIAL-fill bookkeeping
    /// can compare the chain-reported size against what was requested.
    pub fn virtual_order(id: SlotId, price: f64, kind: OrderKind, size: f64) -> Self {
        Self {
            id,
            price,
            kind,
            state: OrderState::Virtual,
            size,
            ideal_size: size,
            raw_on_chain: None,
        }
    }

    pub fn chain_order_id(&self) -> Option<&ChainOrderId> {
        self.state.chain_order_id()
    }

    /// Shape validity per spec §4.1: SPREAD implies VIRTUAL + size 0,
    /// non-VIRTUAL implies a chain order id is present, size is never
    /// negative.
    pub fn is_well_formed(&self) -> bool {
        if self.size < 0.0 {
            return false;
        }
        if self.kind.is_spread() {
            return self.state.is_virtual() && self.size == 0.0;
        }
        true
    }
}

/// Which native asset a fund side is denominated in: base for SELL orders,
/// quote for BUY orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Last known chain balance snapshot for one side's asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AccountTotals {
    pub total: f64,
    pub free: f64,
}

/// Derived committed/virtual/available figures for one side's asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Funds {
    /// Sigma size of ACTIVE+PARTIAL orders whose chain_order_id is set.
    pub committed_chain: f64,
    /// Sigma size of all non-VIRTUAL orders.
    pub committed_grid: f64,
    /// Sigma size of VIRTUAL orders with non-zero intended size.
    pub virtual_: f64,
    /// Realized proceeds from fills awaiting redeployment.
    pub cache_funds: f64,
    /// Accumulated native-token fees owed, settled lazily.
    pub bts_fees_owed: f64,
}

impl Funds {
    pub fn total_grid(&self) -> f64 {
        self.committed_grid + self.virtual_
    }
}

/// The per-side fund ledger, plus the invariants checked against it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SideLedger {
    pub totals: AccountTotals,
    pub funds: Funds,
}

impl SideLedger {
    /// Optimistic available balance: chain free minus orders we believe
    /// the chain already sees, clamped to >= 0.
    pub fn available(&self) -> f64 {
        (self.totals.free - (self.funds.committed_grid - self.funds.committed_chain)).max(0.0)
    }

    /// I1: total = free + committed_chain.
    pub fn check_i1(&self, tolerance: f64) -> bool {
        (self.totals.total - (self.totals.free + self.funds.committed_chain)).abs() <= tolerance
    }

    /// I2: available <= free.
    pub fn check_i2(&self, tolerance: f64) -> bool {
        self.available() <= self.totals.free + tolerance
    }

    /// I3: committed_grid <= total.
    pub fn check_i3(&self, tolerance: f64) -> bool {
        self.funds.committed_grid <= self.totals.total + tolerance
    }

    /// I4: virtual + committed_grid = total_grid.
    pub fn check_i4(&self, tolerance: f64) -> bool {
        (self.funds.virtual_ + self.funds.committed_grid - self.funds.total_grid()).abs()
            <= tolerance
    }

    pub fn check_all(&self, tolerance: f64) -> Vec<&'static str> {
        let mut violations = Vec::new();
        if !self.check_i1(tolerance) {
            violations.push("I1: total != free + committed_chain");
        }
        if !self.check_i2(tolerance) {
            violations.push("I2: available > free");
        }
        if !self.check_i3(tolerance) {
            violations.push("I3: committed_grid > total");
        }
        if !self.check_i4(tolerance) {
            violations.push("I4: virtual + committed_grid != total_grid");
        }
        violations
    }
}

/// Full fund ledger, one [`SideLedger`] per side.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FundLedger {
    pub buy: SideLedger,
    pub sell: SideLedger,
}

impl FundLedger {
    pub fn side(&self, side: Side) -> &SideLedger {
        match side {
            Side::Buy => &self.buy,
            Side::Sell => &self.sell,
        }
    }

    pub fn side_mut(&mut self, side: Side) -> &mut SideLedger {
        match side {
            Side::Buy => &mut self.buy,
            Side::Sell => &mut self.sell,
        }
    }
}

/// The rebalance state machine driven by the COW pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebalanceState {
    Normal,
    Rebalancing,
    Broadcasting,
}

/// Human-readable tag describing why an order was mutated, recorded in
/// the audit ring alongside the before/after order.
pub type Cause = String;

/// Map type used for slot -> order storage (kept as an alias so index
/// implementations can be swapped without touching call sites).
pub type SlotMap = HashMap<SlotId, Order>;
