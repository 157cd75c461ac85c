//! Crate-wide error type for everything outside the core order-manager
//! (chain transport, persistence I/O, configuration). The core has its own
//! richer [`crate::core::errors::CoreError`]; this type converts into it at
//! the boundary.

use thiserror::Error;

/// Top-level error type returned by non-core collaborators (chain client,
/// persistence layer, configuration loading).
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("chain RPC error: {0}")]
    Chain(String),

    #[error("wallet/key error: {0}")]
    Wallet(String),
}
