//! Small numeric helpers shared across the crate.

/// Truncate (or round up) `value` to `decimals` decimal places.
///
/// `round_up = false` truncates toward zero; `round_up = true` bumps the
/// last retained digit by one unit before truncation. Used for price/size
/// rounding against exchange precision, and for epsilon-tolerant order
/// comparisons in the COW pipeline's delta builder.
pub fn truncate_float(value: f64, decimals: u32, round_up: bool) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    let scaled = if round_up { scaled + 1.0 } else { scaled };
    scaled.trunc() / factor
}

/// Relative difference in basis points between two values, signed.
pub fn bps_diff(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        return 0.0;
    }
    (a - b) / b * 10_000.0
}

/// True if `a` and `b` are equal within `epsilon`.
pub fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() <= epsilon
}

/// Tolerance for a fund-ledger invariant check: the larger of an absolute
/// floor derived from `precision` decimal places and a relative floor of
/// 0.1% of `balance`.
pub fn ledger_tolerance(balance: f64, precision: u32) -> f64 {
    let absolute = 10f64.powi(-(precision as i32));
    let relative = balance.abs() * 0.001;
    absolute.max(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_basic() {
        assert!((truncate_float(1.23456, 2, false) - 1.23).abs() < 1e-9);
        assert!((truncate_float(1.23956, 2, false) - 1.23).abs() < 1e-9);
    }

    #[test]
    fn truncate_round_up_bumps_last_digit() {
        let rounded = truncate_float(15.217329, 6, true);
        assert!((rounded - 15.217330).abs() < 1e-9, "got {rounded}");
    }

    #[test]
    fn bps_diff_sign() {
        assert!(bps_diff(101.0, 100.0) > 0.0);
        assert!(bps_diff(99.0, 100.0) < 0.0);
        assert_eq!(bps_diff(100.0, 0.0), 0.0);
    }

    #[test]
    fn approx_eq_within_epsilon() {
        assert!(approx_eq(1.0000001, 1.0000002, 1e-6));
        assert!(!approx_eq(1.0, 1.1, 1e-6));
    }

    #[test]
    fn ledger_tolerance_picks_larger_floor() {
        // small balance: absolute floor dominates
        assert!((ledger_tolerance(1.0, 8) - 1e-8).abs() < 1e-12);
        // large balance: relative floor dominates
        assert!((ledger_tolerance(1_000_000.0, 8) - 1000.0).abs() < 1e-6);
    }
}
