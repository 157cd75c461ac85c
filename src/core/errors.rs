//! Error kinds raised by the order-manager core.

use thiserror::Error;

/// Errors that can occur inside the order-manager core (master grid,
/// accountant, sync engine, strategy, COW pipeline).
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid order shape for slot {slot_id}: {reason}")]
    InvalidState { slot_id: String, reason: String },

    #[error("fund ledger invariant violated on {side:?}: {violations:?}")]
    InvariantViolation {
        side: crate::core::types::Side,
        violations: Vec<&'static str>,
    },

    #[error("refusing stale commit: working grid base_version {base_version} != master version {master_version} (reason: {reason})")]
    StaleCommit {
        base_version: u64,
        master_version: u64,
        reason: String,
    },

    #[error("insufficient funds on {side:?}: need {required}, have {available}")]
    InsufficientFunds {
        side: crate::core::types::Side,
        required: f64,
        available: f64,
    },

    #[error("chain order for slot {slot_id} has mismatched side (expected {expected:?})")]
    TypeMismatch {
        slot_id: String,
        expected: crate::core::types::OrderKind,
    },

    #[error("residual size {residual} below minimum {minimum}, treating as full fill")]
    GhostFill { residual: f64, minimum: f64 },

    #[error("duplicate fill operation id: {0}")]
    DuplicateFill(String),

    #[error("transient chain error: {0}")]
    ChainTransient(String),

    #[error("slot not found: {0}")]
    SlotNotFound(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
