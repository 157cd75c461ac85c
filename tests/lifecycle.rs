//! End-to-end lifecycle scenarios against the public core API: a grid
//! placed and broadcast, then driven through partial fills, a full
//! fill with boundary shift, a type-mismatched snapshot order, dust,
//! and deferred fee settlement.

use grid_market_maker::core::accountant::Accountant;
use grid_market_maker::core::grid::{ApplyOpts, MasterGrid};
use grid_market_maker::core::sync::{AssetAmount, ChainOrder, FeeRates, FillOp, ManagedAssetPair, SyncEngine};
use grid_market_maker::core::types::{Order, OrderKind, OrderState, Side};

fn pair() -> ManagedAssetPair {
    ManagedAssetPair {
        base_asset_id: "1.3.0".into(),
        quote_asset_id: "1.3.121".into(),
        base_precision: 5,
        quote_precision: 5,
    }
}

/// Market/maker/taker and native operation fees used by the lifecycle
/// scenarios below, chosen to be nonzero across the board so a scenario
/// that forgets to net a fee shows up as a wrong assertion rather than
/// passing by accident on an all-zero schedule.
fn lifecycle_fee_rates() -> FeeRates {
    FeeRates {
        market_fee_percent: 0.01,
        taker_fee_percent: 0.01,
        maker_fee_percent: 0.005,
        update_fee: 0.05,
        cancel_fee: 0.1,
    }
}

/// S1 — full lifecycle, no faults: three BUY, three SELL, two SPREAD
/// slots placed then broadcast; ledgers land exactly on budget.
#[test]
fn s1_full_lifecycle_no_faults() {
    let mut grid = MasterGrid::new();
    let mut acct = Accountant::new();
    acct.set_account_totals(Side::Buy, 3000.0, 3000.0);
    acct.set_account_totals(Side::Sell, 30.0, 30.0);

    let slots = [
        ("buy-0", 99.0, OrderKind::Buy, 1000.0),
        ("buy-1", 98.0, OrderKind::Buy, 1000.0),
        ("buy-2", 97.0, OrderKind::Buy, 1000.0),
        ("sell-0", 101.0, OrderKind::Sell, 10.0),
        ("sell-1", 102.0, OrderKind::Sell, 10.0),
        ("sell-2", 103.0, OrderKind::Sell, 10.0),
    ];

    for (id, price, kind, size) in slots {
        let virt = Order::virtual_order(id.into(), price, kind, size);
        grid.apply_order_update(virt, "initial place", &mut acct, ApplyOpts::default())
            .unwrap();
    }
    for (id, price) in [("spread-0", 99.5), ("spread-1", 100.5)] {
        grid.apply_order_update(Order::spread(id.into(), price), "initial place", &mut acct, ApplyOpts::default())
            .unwrap();
    }

    assert_eq!(grid.len(), 8);

    for (id, price, kind, size) in slots {
        let active = Order {
            id: id.into(),
            price,
            kind,
            state: OrderState::Active {
                chain_order_id: format!("1.7.{id}"),
            },
            size,
            ideal_size: size,
            raw_on_chain: None,
        };
        grid.apply_order_update(active, "broadcast confirmed", &mut acct, ApplyOpts::default())
            .unwrap();
    }

    let buy = acct.ledger().side(Side::Buy);
    let sell = acct.ledger().side(Side::Sell);
    assert_eq!(buy.available(), 0.0);
    assert_eq!(sell.available(), 0.0);
    assert_eq!(buy.funds.committed_grid, 3000.0);
    assert_eq!(sell.funds.committed_grid, 30.0);
    assert_eq!(buy.funds.committed_grid, buy.funds.total_grid());
    assert_eq!(sell.funds.committed_grid, sell.funds.total_grid());
}

fn placed_buy_0(grid: &mut MasterGrid, acct: &mut Accountant) {
    acct.set_account_totals(Side::Buy, 3000.0, 3000.0);
    acct.set_account_totals(Side::Sell, 30.0, 30.0);
    let virt = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 3000.0);
    grid.apply_order_update(virt, "initial place", acct, ApplyOpts::default()).unwrap();
    let active = Order {
        id: "buy-0".into(),
        price: 99.0,
        kind: OrderKind::Buy,
        state: OrderState::Active {
            chain_order_id: "1.7.100".into(),
        },
        size: 3000.0,
        ideal_size: 3000.0,
        raw_on_chain: None,
    };
    grid.apply_order_update(active, "broadcast confirmed", acct, ApplyOpts::default()).unwrap();
}

/// S2 — partial fill then rebalance: `buy-0` partially fills for 1500,
/// cache funds on the opposite side are credited, the slot lands in
/// PARTIAL, and nothing else in the grid moves this cycle.
#[test]
fn s2_partial_fill_credits_cache_and_virtualizes_nothing() {
    let mut grid = MasterGrid::new();
    let mut acct = Accountant::new();
    placed_buy_0(&mut grid, &mut acct);

    let sync = SyncEngine::new(pair());
    let fill = FillOp {
        block_num: 1,
        id: "op-1".into(),
        order_id: "1.7.100".into(),
        pays: AssetAmount {
            amount: 1500.0,
            asset_id: "1.3.121".into(),
        },
        receives: AssetAmount {
            amount: 1500.0 / 99.0,
            asset_id: "1.3.0".into(),
        },
        is_maker: true,
    };

    sync.sync_from_fill_history(&mut grid, &mut acct, &fill, 0.0001, &lifecycle_fee_rates())
        .unwrap();

    let slot = grid.get("buy-0").unwrap();
    assert!(matches!(&slot.state, OrderState::Partial { chain_order_id } if chain_order_id == "1.7.100"));
    assert_eq!(slot.size, 1500.0);
    // Maker fill: market fee plus maker fee netted out of the credited amount.
    let expected_net = (1500.0 / 99.0) * (1.0 - 0.01 - 0.005);
    assert!((acct.ledger().side(Side::Sell).funds.cache_funds - expected_net).abs() < 1e-9);
    assert!((acct.ledger().side(Side::Buy).funds.bts_fees_owed - 0.05).abs() < 1e-9);
}

/// S3 — full fill completes the residual: the slot virtualizes back to
/// SPREAD and the chain id is dropped.
#[test]
fn s3_full_fill_virtualizes_the_slot() {
    let mut grid = MasterGrid::new();
    let mut acct = Accountant::new();
    placed_buy_0(&mut grid, &mut acct);

    let sync = SyncEngine::new(pair());
    let partial = FillOp {
        block_num: 1,
        id: "op-1".into(),
        order_id: "1.7.100".into(),
        pays: AssetAmount {
            amount: 1500.0,
            asset_id: "1.3.121".into(),
        },
        receives: AssetAmount {
            amount: 1500.0 / 99.0,
            asset_id: "1.3.0".into(),
        },
        is_maker: true,
    };
    sync.sync_from_fill_history(&mut grid, &mut acct, &partial, 0.0001, &lifecycle_fee_rates())
        .unwrap();

    let remainder = FillOp {
        block_num: 2,
        id: "op-2".into(),
        order_id: "1.7.100".into(),
        pays: AssetAmount {
            amount: 1500.0,
            asset_id: "1.3.121".into(),
        },
        receives: AssetAmount {
            amount: 1500.0 / 99.0,
            asset_id: "1.3.0".into(),
        },
        is_maker: true,
    };
    sync.sync_from_fill_history(&mut grid, &mut acct, &remainder, 0.0001, &lifecycle_fee_rates())
        .unwrap();

    let slot = grid.get("buy-0").unwrap();
    assert_eq!(slot.state, OrderState::Virtual);
    assert_eq!(slot.kind, OrderKind::Spread);
    assert_eq!(slot.size, 0.0);
    assert_eq!(acct.ledger().side(Side::Buy).funds.committed_chain, 0.0);
}

/// S5 — a chain order whose side is swapped relative to its slot's
/// model is never allowed to mutate that slot; it's queued for
/// cancellation as surplus instead.
#[test]
fn s5_type_mismatch_never_mutates_the_slot() {
    let mut grid = MasterGrid::new();
    let mut acct = Accountant::new();
    acct.set_account_totals(Side::Sell, 30.0, 30.0);
    let virt = Order::virtual_order("sell-2".into(), 103.0, OrderKind::Sell, 10.0);
    grid.apply_order_update(virt, "initial place", &mut acct, ApplyOpts::default()).unwrap();
    let active = Order {
        id: "sell-2".into(),
        price: 103.0,
        kind: OrderKind::Sell,
        state: OrderState::Active {
            chain_order_id: "1.7.200".into(),
        },
        size: 10.0,
        ideal_size: 10.0,
        raw_on_chain: None,
    };
    grid.apply_order_update(active, "broadcast confirmed", &mut acct, ApplyOpts::default()).unwrap();

    let before = grid.get("sell-2").unwrap().clone();

    // Base/quote asset ids inverted relative to the pair: this looks
    // like a BUY order wearing `sell-2`'s chain id.
    let swapped = ChainOrder {
        id: "1.7.200".into(),
        sell_price_base: AssetAmount {
            amount: 1030.0,
            asset_id: "1.3.121".into(),
        },
        sell_price_quote: AssetAmount {
            amount: 10.0,
            asset_id: "1.3.0".into(),
        },
        for_sale: 1030.0,
    };

    let sync = SyncEngine::new(pair());
    let result = tokio_test_block_on(sync.sync_from_open_orders(&mut grid, &mut acct, &[swapped.clone()]));

    let after = grid.get("sell-2").unwrap().clone();
    assert_eq!(before, after, "slot must be untouched on a type mismatch");
    assert_eq!(result.unwrap().orders_needing_correction.len(), 1);
}

/// S6 — ghost-fill dust: a residual below the minimum order size is
/// treated as a full fill, crediting proceeds for the whole original
/// size's worth of consumption.
#[test]
fn s6_ghost_fill_dust_is_treated_as_full() {
    let mut grid = MasterGrid::new();
    let mut acct = Accountant::new();
    acct.set_account_totals(Side::Buy, 3000.0, 3000.0);
    let virt = Order::virtual_order("buy-0".into(), 99.0, OrderKind::Buy, 249.27798);
    grid.apply_order_update(virt, "initial place", &mut acct, ApplyOpts::default()).unwrap();
    let active = Order {
        id: "buy-0".into(),
        price: 99.0,
        kind: OrderKind::Buy,
        state: OrderState::Active {
            chain_order_id: "1.7.300".into(),
        },
        size: 249.27798,
        ideal_size: 249.27798,
        raw_on_chain: None,
    };
    grid.apply_order_update(active, "broadcast confirmed", &mut acct, ApplyOpts::default()).unwrap();

    let sync = SyncEngine::new(pair());
    let fill = FillOp {
        block_num: 1,
        id: "op-1".into(),
        order_id: "1.7.300".into(),
        pays: AssetAmount {
            amount: 249.27795,
            asset_id: "1.3.121".into(),
        },
        receives: AssetAmount {
            amount: 249.27798 / 99.0,
            asset_id: "1.3.0".into(),
        },
        is_maker: true,
    };
    sync.sync_from_fill_history(&mut grid, &mut acct, &fill, 0.0001, &lifecycle_fee_rates())
        .unwrap();

    let slot = grid.get("buy-0").unwrap();
    assert_eq!(slot.kind, OrderKind::Spread);
    assert_eq!(slot.state, OrderState::Virtual);
    let expected_net = (249.27798 / 99.0) * (1.0 - 0.01 - 0.005);
    assert!((acct.ledger().side(Side::Sell).funds.cache_funds - expected_net).abs() < 1e-9);
    // Ghost fill: residual below the dust floor, treated as a full fill
    // and billed the cancel fee rather than the update fee. Buy-side free
    // balance comfortably covers it, so it settles in this same call.
    assert_eq!(acct.ledger().side(Side::Buy).funds.bts_fees_owed, 0.0);
    assert!((acct.ledger().side(Side::Buy).totals.free - (2750.72202 - 0.1)).abs() < 1e-9);
}

/// S7 — BTS fee settlement deferral: owed fees can't be settled until
/// free balance covers them, then settle in one shot once it does.
#[test]
fn s7_fee_settlement_defers_until_free_balance_covers_it() {
    let mut acct = Accountant::new();
    acct.ledger_mut().sell.funds.bts_fees_owed = 50.0;
    acct.ledger_mut().sell.funds.cache_funds = 30.0;
    acct.ledger_mut().sell.totals.free = 40.0;

    acct.settle_bts_fees(Side::Sell);
    assert_eq!(acct.ledger().side(Side::Sell).totals.free, 40.0, "deferred: free unchanged");
    assert_eq!(acct.ledger().side(Side::Sell).funds.cache_funds, 30.0);
    assert_eq!(acct.ledger().side(Side::Sell).funds.bts_fees_owed, 50.0);

    acct.ledger_mut().sell.totals.free = 100.0;
    acct.settle_bts_fees(Side::Sell);
    assert_eq!(acct.ledger().side(Side::Sell).totals.free, 50.0);
    assert_eq!(acct.ledger().side(Side::Sell).funds.cache_funds, 0.0);
    assert_eq!(acct.ledger().side(Side::Sell).funds.bts_fees_owed, 0.0);
}

/// Minimal single-threaded executor for the one `async fn` this file
/// needs to drive outside `#[tokio::test]`, avoiding pulling the full
/// runtime into every synchronous scenario above.
fn tokio_test_block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("failed to build current-thread runtime")
        .block_on(fut)
}
