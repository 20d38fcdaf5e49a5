//! Derives next-buy, stop-loss and profit prices from a ledger.

use rust_decimal::Decimal;

use crate::error::PositionError;
use crate::models::{PhaseIndex, PhaseTarget, PositionLedger, PriceTargets};

use super::PyramidConfig;

/// Pure function of the ledger: calling it twice on the same state gives the same answer.
#[derive(Debug, Clone)]
pub struct TargetCalculator {
    config: PyramidConfig,
}

impl TargetCalculator {
    pub fn new(config: PyramidConfig) -> Self {
        Self { config }
    }

    /// Compute the target triple for the current state of `ledger`.
    pub fn compute(&self, ledger: &PositionLedger) -> Result<PriceTargets, PositionError> {
        if !ledger.is_open() {
            return Ok(PriceTargets::none());
        }

        let top = ledger
            .top_holding()
            .ok_or_else(|| corrupt(ledger, "open position without holdings".to_string()))?;
        let index = top.phase;
        let last = self.config.model.last_index();

        if index > last {
            return Err(corrupt(ledger, format!("holding at phase {} beyond model", index)));
        }

        let current = phase_target(ledger, index)?;
        let base = phase_target(ledger, 0)?;

        let (next_buy_price, next_buy_shares) = if index < last {
            let next = phase_target(ledger, index + 1)?;
            (next.price, next.shares)
        } else {
            // Top of the pyramid, no further scaling in
            (Decimal::ZERO, Decimal::ZERO)
        };

        Ok(PriceTargets {
            current_phase: Some(index),
            next_buy_price,
            next_buy_shares,
            stop_loss_price: current.stop_loss_price,
            profit_price: base
                .price
                .checked_mul(self.config.max_profit_level)
                .ok_or_else(|| {
                    PositionError::validation(format!(
                        "profit target for base price {} is out of range",
                        base.price
                    ))
                })?,
        })
    }
}

fn phase_target(ledger: &PositionLedger, index: PhaseIndex) -> Result<PhaseTarget, PositionError> {
    ledger
        .phase_targets
        .get(index)
        .copied()
        .ok_or_else(|| corrupt(ledger, format!("no target for phase {}", index)))
}

fn corrupt(ledger: &PositionLedger, reason: String) -> PositionError {
    PositionError::Corrupt {
        user: ledger.user.clone(),
        symbol: ledger.symbol.clone(),
        reason,
    }
}
