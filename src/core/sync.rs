//! Sync engine: reconciles the master grid against chain snapshots
//! (`syncFromOpenOrders`) and fill-history events
//! (`syncFromFillHistory`).

use log::warn;
use tokio::sync::Mutex;

use crate::audit_event;
use crate::helpers::approx_eq;

use super::accountant::{Accountant, FillSettlement};
use super::audit::AuditCategory;
use super::errors::{CoreError, CoreResult};
use super::grid::{ApplyOpts, BootstrapScope, MasterGrid};
use super::types::{ChainOrderId, Order, OrderKind, OrderState, RawOnChain, Side, SlotId};

/// Market-fee rates and native-token operation fees, as reported by
/// `getFeeSchedule`. The sync engine has no chain access of its own; the
/// caller driving `sync_from_fill_history` (the cycle runner) fetches this
/// once per cycle and hands it down.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeeRates {
    pub market_fee_percent: f64,
    pub taker_fee_percent: f64,
    pub maker_fee_percent: f64,
    /// Native fee charged for the update operation a surviving partial
    /// fill implicitly leaves behind.
    pub update_fee: f64,
    /// Native fee charged for the cancel a fully-consumed fill implies.
    pub cancel_fee: f64,
}

/// One side of a chain order's `sell_price`: an amount of an asset.
#[derive(Debug, Clone)]
pub struct AssetAmount {
    pub amount: f64,
    pub asset_id: String,
}

/// An order as reported by `getOpenOrders`.
#[derive(Debug, Clone)]
pub struct ChainOrder {
    pub id: ChainOrderId,
    pub sell_price_base: AssetAmount,
    pub sell_price_quote: AssetAmount,
    pub for_sale: f64,
}

/// A fill-history event (BitShares-style operation type 4).
#[derive(Debug, Clone)]
pub struct FillOp {
    pub block_num: u64,
    pub id: String,
    pub order_id: ChainOrderId,
    pub pays: AssetAmount,
    pub receives: AssetAmount,
    pub is_maker: bool,
}

/// The asset pair this grid manages, used to filter foreign-pair chain
/// orders out of `sync_from_open_orders`.
#[derive(Debug, Clone)]
pub struct ManagedAssetPair {
    pub base_asset_id: String,
    pub quote_asset_id: String,
    pub base_precision: u32,
    pub quote_precision: u32,
}

impl ManagedAssetPair {
    fn owns(&self, order: &ChainOrder) -> bool {
        (order.sell_price_base.asset_id == self.base_asset_id
            && order.sell_price_quote.asset_id == self.quote_asset_id)
            || (order.sell_price_base.asset_id == self.quote_asset_id
                && order.sell_price_quote.asset_id == self.base_asset_id)
    }

    /// Price tolerance per §4.3: the smaller of the two assets'
    /// per-unit precision floors. A result of 0 means strict equality.
    fn price_tolerance(&self) -> f64 {
        let base_floor = 10f64.powi(-(self.base_precision as i32));
        let quote_floor = 10f64.powi(-(self.quote_precision as i32));
        base_floor.min(quote_floor)
    }
}

/// Result of one `sync_from_open_orders` pass.
#[derive(Debug, Default)]
pub struct SnapshotSyncResult {
    pub filled_slots: Vec<SlotId>,
    pub updated_slots: Vec<SlotId>,
    pub orders_needing_correction: Vec<ChainOrder>,
}

/// Reconciles the master grid against chain truth. Holds no state beyond
/// the serialization lock and the managed pair; it mutates the grid and
/// accountant handed to it.
pub struct SyncEngine {
    pair: ManagedAssetPair,
    sync_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(pair: ManagedAssetPair) -> Self {
        Self {
            pair,
            sync_lock: Mutex::new(()),
        }
    }

    /// `syncFromOpenOrders`. Foreign-pair orders are ignored outright.
    /// Type mismatches never mutate the slot (the chain order is queued
    /// as surplus for cancellation instead); price mismatches beyond
    /// tolerance queue a correction without mutating the slot.
    pub async fn sync_from_open_orders(
        &self,
        grid: &mut MasterGrid,
        accountant: &mut Accountant,
        chain_orders: &[ChainOrder],
    ) -> CoreResult<SnapshotSyncResult> {
        let _guard = self.sync_lock.lock().await;
        let _bootstrap = BootstrapScope::enter(grid);

        let mut result = SnapshotSyncResult::default();
        let tolerance = self.pair.price_tolerance();

        for chain_order in chain_orders {
            if !self.pair.owns(chain_order) {
                continue;
            }
            let Some(slot) = grid.find_by_chain_order_id(&chain_order.id) else {
                continue;
            };
            let slot_id = slot.id.clone();

            if !self.type_matches(slot, chain_order) {
                result.orders_needing_correction.push(chain_order.clone());
                continue;
            }

            let model_price = slot.price;
            let chain_price = self.implied_price(chain_order);
            if tolerance > 0.0 && !approx_eq(model_price, chain_price, tolerance) {
                result.orders_needing_correction.push(chain_order.clone());
                continue;
            }

            let model_size = slot.size;
            if chain_order.for_sale < model_size - tolerance {
                let raw = RawOnChain {
                    chain_order_id: chain_order.id.clone(),
                    for_sale: chain_order.for_sale,
                    price: chain_price,
                };
                let authoritative_size = raw.for_sale;
                let updated = Order {
                    state: OrderState::Partial {
                        chain_order_id: chain_order.id.clone(),
                    },
                    size: authoritative_size,
                    raw_on_chain: Some(raw),
                    ..slot.clone()
                };
                grid.apply_order_update(
                    updated,
                    "sync: partial fill detected",
                    accountant,
                    ApplyOpts::default(),
                )?;
                result.updated_slots.push(slot_id);
            }
        }

        // Non-VIRTUAL slots whose chain order vanished from the snapshot
        // were consumed by the chain; report as filled. `PARTIAL ->
        // ACTIVE` restoration is explicitly forbidden here — only a
        // fresh fill event (sync_from_fill_history) may move a slot
        // out of PARTIAL.
        let present_ids: std::collections::HashSet<&str> =
            chain_orders.iter().map(|o| o.id.as_str()).collect();
        let missing_slots: Vec<SlotId> = grid
            .iter()
            .filter(|o| {
                o.state
                    .chain_order_id()
                    .map(|id| !present_ids.contains(id.as_str()))
                    .unwrap_or(false)
            })
            .map(|o| o.id.clone())
            .collect();

        for slot_id in missing_slots {
            result.filled_slots.push(slot_id);
        }

        audit_event!(
            AuditCategory::FillEvents,
            "snapshot sync: {} filled, {} updated, {} need correction",
            result.filled_slots.len(),
            result.updated_slots.len(),
            result.orders_needing_correction.len()
        );

        Ok(result)
    }

    /// A chain order selling the managed base asset for quote is a SELL;
    /// one selling quote for base is a BUY. Anything else (shouldn't
    /// happen once `owns` has filtered) never matches.
    fn chain_order_kind(&self, chain_order: &ChainOrder) -> Option<OrderKind> {
        if chain_order.sell_price_base.asset_id == self.pair.base_asset_id {
            Some(OrderKind::Sell)
        } else if chain_order.sell_price_base.asset_id == self.pair.quote_asset_id {
            Some(OrderKind::Buy)
        } else {
            None
        }
    }

    fn type_matches(&self, slot: &Order, chain_order: &ChainOrder) -> bool {
        self.chain_order_kind(chain_order) == Some(slot.kind)
    }

    /// Price in quote-per-base terms, matching the convention used for
    /// every slot's `price` field.
    fn implied_price(&self, chain_order: &ChainOrder) -> f64 {
        if chain_order.sell_price_base.asset_id == self.pair.base_asset_id {
            if chain_order.sell_price_base.amount == 0.0 {
                0.0
            } else {
                chain_order.sell_price_quote.amount / chain_order.sell_price_base.amount
            }
        } else if chain_order.sell_price_quote.amount == 0.0 {
            0.0
        } else {
            chain_order.sell_price_base.amount / chain_order.sell_price_quote.amount
        }
    }

    /// `syncFromFillHistory`. Dedup is owned by the accountant (keyed on
    /// `chain_operation_id`); a `DuplicateFill` here is expected under
    /// redelivery and is swallowed after logging per the propagation
    /// policy.
    pub fn sync_from_fill_history(
        &self,
        grid: &mut MasterGrid,
        accountant: &mut Accountant,
        fill: &FillOp,
        min_order_size: f64,
        fee_rates: &FeeRates,
    ) -> CoreResult<()> {
        let Some(slot) = grid.find_by_chain_order_id(&fill.order_id) else {
            return Err(CoreError::SlotNotFound(fill.order_id.clone()));
        };
        let slot = slot.clone();
        let side = match slot.kind {
            OrderKind::Buy => Side::Buy,
            OrderKind::Sell => Side::Sell,
            OrderKind::Spread => {
                return Err(CoreError::TypeMismatch {
                    slot_id: slot.id,
                    expected: OrderKind::Spread,
                })
            }
        };

        let authoritative_size = slot
            .raw_on_chain
            .as_ref()
            .map(|raw| raw.for_sale)
            .unwrap_or(slot.size);
        let residual = (authoritative_size - fill.pays.amount).max(0.0);
        let dust_floor = min_order_size.max(10f64.powi(-(self.pair.base_precision as i32)));
        let fully_consumed = residual <= dust_floor;

        if fully_consumed && residual > 0.0 {
            let ghost = CoreError::GhostFill { residual, minimum: dust_floor };
            warn!("{ghost}");
            audit_event!(AuditCategory::EdgeCases, "{}", ghost);
        }

        let new_order = if fully_consumed {
            Order::spread(slot.id.clone(), slot.price)
        } else {
            Order {
                state: OrderState::Partial {
                    chain_order_id: fill.order_id.clone(),
                },
                size: residual,
                ..slot.clone()
            }
        };

        let fee_rate = fee_rates.market_fee_percent
            + if fill.is_maker {
                fee_rates.maker_fee_percent
            } else {
                fee_rates.taker_fee_percent
            };
        let net_receive_amount = fill.receives.amount * (1.0 - fee_rate);
        let operation_fee = if fully_consumed {
            fee_rates.cancel_fee
        } else {
            fee_rates.update_fee
        };

        let settlement = FillSettlement {
            side,
            net_receive_amount,
            operation_fee,
            chain_operation_id: fill.id.clone(),
        };

        match accountant.process_fill(settlement) {
            Ok(()) => {}
            Err(CoreError::DuplicateFill(id)) => {
                audit_event!(
                    AuditCategory::EdgeCases,
                    "duplicate fill event {} ignored",
                    id
                );
                return Ok(());
            }
            Err(other) => return Err(other),
        }

        let cause = if fully_consumed {
            "fill: fully consumed"
        } else {
            "fill: partial"
        };
        grid.apply_order_update(new_order, cause, accountant, ApplyOpts::default())?;
        Ok(())
    }
}
