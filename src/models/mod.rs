//! Data models for the pyramid ladder, position ledgers and transactions.

mod ledger;
mod pyramid;
mod transaction;

pub use ledger::{Holding, PositionLedger, PriceTargets};
pub use pyramid::{PhaseIndex, PhaseTarget, PyramidModel, PyramidPhase};
pub use transaction::{TradeAction, TransactionRecord, TransactionRequest};
