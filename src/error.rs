//! Error types shared by the ledger, the store and the price feed.

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

/// Failures of a buy/sell against a position ledger.
#[derive(Debug, Error)]
pub enum PositionError {
    /// Bad action, price or shares. Rejected before anything is touched.
    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("not enough shares to sell: requested {requested}, holding {available}")]
    InsufficientShares {
        requested: Decimal,
        available: Decimal,
    },

    #[error("no position of {symbol} found for {user}")]
    NotFound { user: String, symbol: String },

    /// The ledger refers to a phase that has no target.
    #[error("corrupt ledger for {user}/{symbol}: {reason}")]
    Corrupt {
        user: String,
        symbol: String,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PositionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Errors that must stop a scan instead of skipping one record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_fatal())
    }
}

/// Failures of the keyed record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid decimal in column {column}: {value}")]
    InvalidDecimal { column: &'static str, value: String },

    #[error("corrupt record {user}/{symbol}: {reason}")]
    Corrupt {
        user: String,
        symbol: String,
        reason: String,
    },

    /// A stored holding or target names a phase the model does not know.
    #[error("unknown pyramiding phase: {0}")]
    UnknownPhase(String),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownPhase(_))
    }
}

/// Failures of the external price feed.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("quote request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("quote provider rejected request: {0}")]
    Provider(String),

    #[error("quote provider throttled request: {0}")]
    RateLimited(String),

    #[error("no price data for {0}")]
    NoData(String),

    #[error("price lookup for {symbol} timed out after {after:?}")]
    Timeout { symbol: String, after: Duration },

    #[error("price lookup for {symbol} failed after {attempts} attempts: {last}")]
    Exhausted {
        symbol: String,
        attempts: u32,
        last: String,
    },
}

impl FeedError {
    /// Whether retrying the same request can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Request(_) | Self::RateLimited(_))
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}
