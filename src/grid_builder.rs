//! Initial grid construction: lays out the geometric price ladder a
//! freshly-bootstrapped bot starts from. Consulted once at startup when
//! no persisted grid snapshot exists; every slot starts `VIRTUAL` with
//! zero size and is sized/placed on the first rebalance cycle.

use crate::config::GridConfig;
use crate::consts::MIN_SPREAD_ORDERS;
use crate::core::types::{Order, OrderKind};

/// Builds the dense slot ladder described in §3: BUY slots below the
/// start price, a contiguous SPREAD window straddling it, SELL slots
/// above, prices strictly monotonic across slot ids, dense per side from
/// the market outward.
///
/// `start_price` has already been resolved from `GridConfig::start_price`
/// by whatever price-discovery collaborator sits outside this module
/// (pool reserves, order book midpoint, or the fixed value itself).
pub fn build_initial_grid(config: &GridConfig, start_price: f64) -> Vec<Order> {
    let min_price = config.min_price.resolve(start_price);
    let max_price = config.max_price.resolve(start_price);
    let step = 1.0 + config.increment_percent / 100.0;
    let half_spread = 1.0 + config.target_spread_percent / 200.0;

    let mut orders = Vec::new();

    let buy_top = start_price / half_spread;
    let mut price = buy_top;
    let mut buy_idx = 0;
    while price >= min_price && buy_idx < config.active_orders.buy {
        orders.push(Order::virtual_order(format!("buy-{buy_idx}"), price, OrderKind::Buy, 0.0));
        price /= step;
        buy_idx += 1;
    }
    // Dense from the market outward: slot-0 sits nearest the spread, so
    // reverse into ascending price order (BUY prices strictly increase
    // toward the spread).
    orders[..buy_idx].reverse();

    let spread_count = MIN_SPREAD_ORDERS.max(1);
    let sell_bottom = start_price * half_spread;
    let spread_step = (sell_bottom / buy_top).powf(1.0 / (spread_count as f64 + 1.0));
    let mut spread_price = buy_top * spread_step;
    for i in 0..spread_count {
        orders.push(Order::spread(format!("spread-{i}"), spread_price));
        spread_price *= spread_step;
    }

    let mut price = sell_bottom;
    let mut sell_idx = 0;
    while price <= max_price && sell_idx < config.active_orders.sell {
        orders.push(Order::virtual_order(format!("sell-{sell_idx}"), price, OrderKind::Sell, 0.0));
        price *= step;
        sell_idx += 1;
    }

    orders
}
