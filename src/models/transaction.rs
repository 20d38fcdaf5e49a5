//! Buy/sell events applied to a position.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::PositionError;

/// Direction of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = PositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            _ => Err(PositionError::validation(format!("unknown action '{}'", s))),
        }
    }
}

/// One entry of the append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub action: TradeAction,
    pub price: Decimal,
    pub shares: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A validated request to apply to a ledger.
#[derive(Debug, Clone)]
pub struct TransactionRequest {
    pub user: String,
    pub symbol: String,
    pub action: TradeAction,
    pub price: Decimal,
    pub shares: Decimal,
    pub timestamp: DateTime<Utc>,
}
