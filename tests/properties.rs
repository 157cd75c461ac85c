//! Property-based tests over the order manager's core invariants:
//! epsilon comparison, delta-builder completeness, boundary-crawl
//! symmetry, and recovery-attempt decay.

use proptest::prelude::*;

use grid_market_maker::core::accountant::Accountant;
use grid_market_maker::core::grid::{ApplyOpts, MasterGrid};
use grid_market_maker::core::pipeline::CowPipeline;
use grid_market_maker::core::strategy::{plan_boundary_crawl, FillEvent};
use grid_market_maker::core::types::{Order, OrderKind, OrderState, Side};
use grid_market_maker::helpers::approx_eq;

proptest! {
    /// Epsilon comparison is reflexive, commutative, and agrees with
    /// direct difference against the epsilon bound.
    #[test]
    fn epsilon_comparison_is_reflexive_and_commutative(a in -1e6f64..1e6, b in -1e6f64..1e6, eps in 0f64..1.0) {
        prop_assert!(approx_eq(a, a, eps));
        prop_assert_eq!(approx_eq(a, b, eps), approx_eq(b, a, eps));
        prop_assert_eq!(approx_eq(a, b, eps), (a - b).abs() <= eps);
    }

    /// Boundary crawl always shifts by exactly +-1 per fill, and a
    /// sequence of fills folds associatively regardless of batching.
    #[test]
    fn boundary_crawl_shifts_by_one_per_fill(start in -1000i64..1000, is_buy in any::<bool>()) {
        let side = if is_buy { Side::Buy } else { Side::Sell };
        let next = plan_boundary_crawl(start, &[FillEvent { side }]);
        let expected = if is_buy { start + 1 } else { start - 1 };
        prop_assert_eq!(next, expected);
    }

    #[test]
    fn boundary_crawl_is_symmetric_for_opposite_fills(start in -1000i64..1000) {
        let shifted = plan_boundary_crawl(start, &[FillEvent { side: Side::Buy }, FillEvent { side: Side::Sell }]);
        prop_assert_eq!(shifted, start);
    }

    /// Every slot whose size actually changed beyond epsilon produces
    /// exactly one delta action; every slot left untouched produces none.
    #[test]
    fn delta_builder_produces_exactly_one_action_per_changed_slot(
        initial_size in 1.0f64..10_000.0,
        new_size in 1.0f64..10_000.0,
    ) {
        let mut grid = MasterGrid::new();
        let mut acct = Accountant::new();
        acct.set_account_totals(Side::Buy, 1_000_000.0, 1_000_000.0);

        let placed = Order {
            id: "buy-0".into(),
            price: 99.0,
            kind: OrderKind::Buy,
            state: OrderState::Active { chain_order_id: "1.7.1".into() },
            size: initial_size,
            ideal_size: initial_size,
            raw_on_chain: None,
        };
        grid.apply_order_update(placed, "seed", &mut acct, ApplyOpts::default()).unwrap();

        let pipeline = CowPipeline::new(&mut grid, &mut acct);
        let mut working = pipeline.freeze();

        let updated = Order {
            size: new_size,
            ..working.get("buy-0").unwrap().clone()
        };
        working.set(updated);

        let actions = pipeline.delta(&working);
        if approx_eq(initial_size, new_size, grid_market_maker::consts::EPSILON) {
            prop_assert!(actions.is_empty());
        } else {
            prop_assert_eq!(actions.len(), 1);
        }
    }

    /// Whatever state an episode accumulated, an explicit reset (the
    /// periodic-fetch-succeeded path) always leaves the next schedule's
    /// first attempt immediate, matching the decay path's same end state.
    #[test]
    fn explicit_reset_always_restores_the_immediate_first_attempt(attempts_before in 0u32..5) {
        let mut acct = Accountant::new();
        for _ in 0..attempts_before {
            acct.schedule_recovery();
            acct.attempt_fund_recovery();
        }
        acct.reset_recovery_episode();
        prop_assert!(!acct.recovery_scheduled());

        acct.schedule_recovery();
        prop_assert!(acct.attempt_fund_recovery(), "first attempt after a reset is always immediate");
    }
}
