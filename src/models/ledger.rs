//! Per-(user, symbol) position ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::pyramid::{PhaseIndex, PhaseTarget};
use super::transaction::TransactionRecord;

/// One retained lot, bought at a given phase and price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Holding {
    pub phase: PhaseIndex,
    pub shares: Decimal,
    pub price: Decimal,
}

/// Alert thresholds derived from the ledger. All zero when the position is flat.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PriceTargets {
    /// Phase of the top holding
    pub current_phase: Option<PhaseIndex>,

    /// Price at which the next phase should be bought (0 at the top phase)
    pub next_buy_price: Decimal,

    /// Size of the next phase's buy
    pub next_buy_shares: Decimal,

    /// Price below which the top phase should be exited
    pub stop_loss_price: Decimal,

    /// Price at which the whole position should be sold
    pub profit_price: Decimal,
}

impl PriceTargets {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Full state of one position.
///
/// `total_shares` always equals the sum of `holdings`, and `holdings` stay sorted
/// by ascending phase index. `targets` is a cache recomputed on every mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionLedger {
    pub user: String,
    pub symbol: String,
    pub total_shares: Decimal,

    /// Price ladder of the current trading cycle, empty while flat
    pub phase_targets: Vec<PhaseTarget>,

    pub holdings: Vec<Holding>,

    /// Audit trail, oldest first
    pub transactions: Vec<TransactionRecord>,

    pub targets: PriceTargets,

    pub updated_at: DateTime<Utc>,
}

impl PositionLedger {
    pub fn is_open(&self) -> bool {
        self.total_shares > Decimal::ZERO
    }

    /// The highest-phase lot: the most recent rung of the pyramid.
    pub fn top_holding(&self) -> Option<&Holding> {
        self.holdings.last()
    }

    /// Transactions most recent first, as served to callers.
    pub fn recent_transactions(&self) -> Vec<TransactionRecord> {
        self.transactions.iter().rev().cloned().collect()
    }

    pub fn holdings_total(&self) -> Decimal {
        self.holdings.iter().map(|h| h.shares).sum()
    }

    /// Check the share-sum and ordering invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        let sum = self.holdings_total();
        if sum != self.total_shares {
            return Err(format!(
                "total shares {} does not match holdings sum {}",
                self.total_shares, sum
            ));
        }

        if self.holdings.windows(2).any(|w| w[0].phase > w[1].phase) {
            return Err("holdings are not sorted by phase".to_string());
        }

        if self.holdings.iter().any(|h| h.shares <= Decimal::ZERO) {
            return Err("holding with non-positive shares".to_string());
        }

        if self.is_open() == self.phase_targets.is_empty() {
            return Err(format!(
                "phase targets {} while holding {} shares",
                if self.phase_targets.is_empty() { "missing" } else { "present" },
                self.total_shares
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger(holdings: Vec<Holding>, total: Decimal) -> PositionLedger {
        PositionLedger {
            user: "alice".to_string(),
            symbol: "AAPL".to_string(),
            total_shares: total,
            phase_targets: if total > Decimal::ZERO {
                vec![PhaseTarget {
                    price: dec!(100),
                    shares: dec!(10),
                    stop_loss_price: dec!(92),
                }]
            } else {
                Vec::new()
            },
            holdings,
            transactions: Vec::new(),
            targets: PriceTargets::none(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_invariants_hold() {
        let l = ledger(
            vec![
                Holding { phase: 0, shares: dec!(10), price: dec!(100) },
                Holding { phase: 1, shares: dec!(8), price: dec!(103) },
            ],
            dec!(18),
        );
        assert!(l.check_invariants().is_ok());
        assert_eq!(l.top_holding().unwrap().phase, 1);
    }

    #[test]
    fn test_invariants_detect_mismatch() {
        let l = ledger(
            vec![Holding { phase: 0, shares: dec!(10), price: dec!(100) }],
            dec!(11),
        );
        assert!(l.check_invariants().is_err());

        let unsorted = ledger(
            vec![
                Holding { phase: 1, shares: dec!(8), price: dec!(103) },
                Holding { phase: 0, shares: dec!(10), price: dec!(100) },
            ],
            dec!(18),
        );
        assert!(unsorted.check_invariants().is_err());
    }

    #[test]
    fn test_flat_ledger() {
        let l = ledger(Vec::new(), Decimal::ZERO);
        assert!(!l.is_open());
        assert!(l.top_holding().is_none());
        assert!(l.check_invariants().is_ok());
    }
}
