//! Pyramiding logic: configuration, transaction processing, target calculation.

mod calculator;
mod config;
mod processor;

pub use calculator::TargetCalculator;
pub use config::PyramidConfig;
pub use processor::{resolve_timestamp, TransactionProcessor};
