//! Crate-wide tuning constants.
//!
//! Mirrors the magic numbers named explicitly in the design: these are not
//! guesses, they come from the behavioural contract the bot must satisfy.

/// Floating point comparison tolerance used by the COW pipeline's delta
/// builder (price/size equality after converting to numeric).
pub const EPSILON: f64 = 1e-6;

/// Minimum number of empty (SPREAD) slots that must sit between the best
/// buy and best sell at all times.
pub const MIN_SPREAD_ORDERS: usize = 2;

/// Multiplier applied to the exchange's minimum order size to get the
/// strategy's effective floor.
pub const MIN_ORDER_SIZE_FACTOR: f64 = 50.0;

/// A PARTIAL order whose remaining size divided by its ideal size falls
/// below this fraction is treated as dust and rotated away.
pub const PARTIAL_DUST_THRESHOLD_PERCENTAGE: f64 = 0.05;

/// Governs whether a chain-resized order is treated as restored to ideal.
pub const PARTIAL_ACTIVE_RESTORE_RATIO: f64 = 0.95;

/// RMS% of relative size difference above which a side's sizing is
/// regenerated from scratch.
pub const RMS_PERCENTAGE: f64 = 14.3;

/// Side cache must exceed this fraction of committed total before a
/// regeneration triggers, alongside the RMS threshold above.
pub const GRID_REGENERATION_PERCENTAGE: f64 = 0.03;

/// Lease timeout for a per-slot lock before it is considered abandoned
/// and reclaimed on next access.
pub const LOCK_TIMEOUT_MS: u64 = 10_000;

/// Minimum interval between lease refreshes.
pub const LOCK_REFRESH_MIN_MS: u64 = 250;

/// Whole-pipeline timeout; on expiry the bot forces a maintenance cycle.
pub const PIPELINE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Cooldown between fund-recovery attempts after the first (immediate) one.
pub const RECOVERY_RETRY_INTERVAL_MS: u64 = 60_000;

/// Hard cap on recovery attempts within one episode.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 5;

/// Idle time after which the recovery attempt counter decays back to zero.
pub const RECOVERY_DECAY_FALLBACK_MS: u64 = 10 * 60 * 1000;

/// Fee-event dedup window.
pub const FEE_DEDUP_TTL_SECS: u64 = 6 * 60 * 60;

/// Fee-event dedup cache capacity before eviction kicks in.
pub const FEE_DEDUP_CAP: usize = 10_000;

/// Fraction of capacity kept after an eviction sweep.
pub const FEE_DEDUP_EVICT_TO: f64 = 0.75;

/// Max retries for a single chain RPC call before bubbling a transient error.
pub const MAX_API_RETRIES: u32 = 5;
