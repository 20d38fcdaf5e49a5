//! Applies BUY and SELL events to a position ledger.
//!
//! Every operation takes a ledger snapshot by reference and returns a new ledger,
//! so a rejected transaction can never leave a half-applied state behind.
//!
//! - BUY on a flat ledger opens a new pyramid anchored at the buy price.
//! - BUY on an open ledger adds a lot at the phase the price has reached.
//! - SELL consumes lots from the highest phase down.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::PositionError;
use crate::models::{
    Holding, PhaseIndex, PhaseTarget, PositionLedger, PriceTargets, TradeAction,
    TransactionRecord, TransactionRequest,
};

use super::{PyramidConfig, TargetCalculator};

/// Transaction processor for pyramided positions.
#[derive(Debug, Clone)]
pub struct TransactionProcessor {
    config: PyramidConfig,
    calculator: TargetCalculator,
}

impl TransactionProcessor {
    pub fn new(config: PyramidConfig) -> Self {
        let calculator = TargetCalculator::new(config.clone());
        Self { config, calculator }
    }

    /// Validate and apply a request to an existing ledger, or open one.
    pub fn apply(
        &self,
        existing: Option<&PositionLedger>,
        request: &TransactionRequest,
    ) -> Result<PositionLedger, PositionError> {
        validate_request(request)?;

        match (existing, request.action) {
            (None, TradeAction::Buy) => self.open(
                &request.user,
                &request.symbol,
                request.price,
                request.shares,
                request.timestamp,
            ),
            (None, TradeAction::Sell) => Err(PositionError::NotFound {
                user: request.user.clone(),
                symbol: request.symbol.clone(),
            }),
            (Some(ledger), TradeAction::Buy) => {
                self.buy(ledger, request.price, request.shares, request.timestamp)
            }
            (Some(ledger), TradeAction::Sell) => {
                self.sell(ledger, request.price, request.shares, request.timestamp)
            }
        }
    }

    /// Create a ledger for the first buy of a symbol.
    pub fn open(
        &self,
        user: &str,
        symbol: &str,
        price: Decimal,
        shares: Decimal,
        at: DateTime<Utc>,
    ) -> Result<PositionLedger, PositionError> {
        validate_amounts(price, shares)?;

        let mut ledger = PositionLedger {
            user: user.to_string(),
            symbol: symbol.to_string(),
            total_shares: Decimal::ZERO,
            phase_targets: Vec::new(),
            holdings: Vec::new(),
            transactions: Vec::new(),
            targets: PriceTargets::none(),
            updated_at: at,
        };
        self.init_pyramid(&mut ledger, price, shares)?;

        self.finish(ledger, record(TradeAction::Buy, price, shares, at))
    }

    /// Add shares to a position.
    pub fn buy(
        &self,
        ledger: &PositionLedger,
        price: Decimal,
        shares: Decimal,
        at: DateTime<Utc>,
    ) -> Result<PositionLedger, PositionError> {
        validate_amounts(price, shares)?;

        let mut next = ledger.clone();

        if next.total_shares.is_zero() {
            // New trading cycle: re-anchor the pyramid, never reuse stale targets
            self.init_pyramid(&mut next, price, shares)?;
        } else {
            let phase = self.target_phase(&next.phase_targets, price);
            debug!(
                symbol = %next.symbol,
                price = %price,
                phase = phase,
                "Bucketing buy into pyramid phase"
            );

            next.holdings.push(Holding {
                phase,
                shares,
                price,
            });
            next.holdings.sort_by_key(|h| h.phase);
            next.total_shares = next.total_shares.checked_add(shares).ok_or_else(|| {
                PositionError::validation(format!(
                    "buying {} shares would overflow the position of {}",
                    shares, ledger.total_shares
                ))
            })?;
        }

        self.finish(next, record(TradeAction::Buy, price, shares, at))
    }

    /// Remove shares from a position, highest phase first.
    pub fn sell(
        &self,
        ledger: &PositionLedger,
        price: Decimal,
        shares: Decimal,
        at: DateTime<Utc>,
    ) -> Result<PositionLedger, PositionError> {
        validate_amounts(price, shares)?;

        if shares > ledger.total_shares {
            return Err(PositionError::InsufficientShares {
                requested: shares,
                available: ledger.total_shares,
            });
        }

        let (mut kept, _) = ledger.holdings.iter().rev().fold(
            (Vec::with_capacity(ledger.holdings.len()), shares),
            |(mut kept, remaining), holding| {
                if remaining.is_zero() {
                    kept.push(holding.clone());
                    (kept, remaining)
                } else if holding.shares > remaining {
                    kept.push(Holding {
                        shares: holding.shares - remaining,
                        ..holding.clone()
                    });
                    (kept, Decimal::ZERO)
                } else {
                    (kept, remaining - holding.shares)
                }
            },
        );
        kept.reverse();

        let mut next = ledger.clone();
        next.holdings = kept;
        next.total_shares -= shares;

        if next.total_shares.is_zero() {
            // Sold everything, the pyramid is closed
            next.phase_targets.clear();
        }

        self.finish(next, record(TradeAction::Sell, price, shares, at))
    }

    /// Phase a buy at `price` belongs to.
    ///
    /// The first phase whose price (less the tolerance band) is still above `price`
    /// marks the ceiling; the buy goes to the phase just below it. A price past every
    /// phase lands in the last one.
    pub fn target_phase(&self, targets: &[PhaseTarget], price: Decimal) -> PhaseIndex {
        for (i, target) in targets.iter().enumerate() {
            // A threshold too large to represent is above any price
            let below = target
                .price
                .checked_mul(self.config.buy_tolerance)
                .map_or(true, |threshold| price < threshold);
            if below {
                return i.saturating_sub(1);
            }
        }

        targets.len().saturating_sub(1)
    }

    fn init_pyramid(
        &self,
        ledger: &mut PositionLedger,
        price: Decimal,
        shares: Decimal,
    ) -> Result<(), PositionError> {
        ledger.phase_targets = self
            .config
            .model
            .phase_targets(price, shares)
            .ok_or_else(|| {
                PositionError::validation(format!(
                    "pyramid targets for {} shares at {} are out of range",
                    shares, price
                ))
            })?;
        ledger.total_shares = shares;
        ledger.holdings = vec![Holding {
            phase: 0,
            shares,
            price,
        }];
        Ok(())
    }

    fn finish(
        &self,
        mut ledger: PositionLedger,
        entry: TransactionRecord,
    ) -> Result<PositionLedger, PositionError> {
        ledger.updated_at = entry.timestamp;
        ledger.transactions.push(entry);
        ledger.targets = self.calculator.compute(&ledger)?;

        debug_assert!(ledger.check_invariants().is_ok());
        Ok(ledger)
    }
}

fn record(action: TradeAction, price: Decimal, shares: Decimal, at: DateTime<Utc>) -> TransactionRecord {
    TransactionRecord {
        action,
        price,
        shares,
        timestamp: at,
    }
}

fn validate_amounts(price: Decimal, shares: Decimal) -> Result<(), PositionError> {
    if price <= Decimal::ZERO {
        return Err(PositionError::validation(format!("price must be positive, got {}", price)));
    }
    if shares <= Decimal::ZERO {
        return Err(PositionError::validation(format!("shares must be positive, got {}", shares)));
    }
    Ok(())
}

fn validate_request(request: &TransactionRequest) -> Result<(), PositionError> {
    if request.user.trim().is_empty() {
        return Err(PositionError::validation("user must not be empty"));
    }
    if request.symbol.trim().is_empty() {
        return Err(PositionError::validation("symbol must not be empty"));
    }
    validate_amounts(request.price, request.shares)
}

/// Parse a caller-supplied timestamp, falling back to `now`.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and `YYYY-MM-DD` (midnight UTC).
pub fn resolve_timestamp(raw: Option<&str>, now: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return now;
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return ts.and_utc();
    }
    if let Some(ts) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return ts.and_utc();
    }

    debug!(raw = %raw, "Unparsable transaction time, using current time");
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn processor() -> TransactionProcessor {
        TransactionProcessor::new(PyramidConfig::default())
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 15, 0, 0).unwrap()
    }

    fn request(action: TradeAction, price: Decimal, shares: Decimal) -> TransactionRequest {
        TransactionRequest {
            user: "alice".to_string(),
            symbol: "AAPL".to_string(),
            action,
            price,
            shares,
            timestamp: at(1),
        }
    }

    /// BUY 10 @ 100, then BUY 8 @ 103.
    fn scenario_a(p: &TransactionProcessor) -> PositionLedger {
        let opened = p.open("alice", "AAPL", dec!(100), dec!(10), at(1)).unwrap();
        p.buy(&opened, dec!(103), dec!(8), at(2)).unwrap()
    }

    #[test]
    fn test_open_initializes_pyramid() {
        let p = processor();
        let ledger = p.open("alice", "AAPL", dec!(100), dec!(10), at(1)).unwrap();

        assert_eq!(ledger.total_shares, dec!(10));
        assert_eq!(
            ledger.holdings,
            vec![Holding { phase: 0, shares: dec!(10), price: dec!(100) }]
        );
        assert_eq!(ledger.phase_targets.len(), 3);
        assert_eq!(ledger.transactions.len(), 1);
        assert_eq!(ledger.targets.next_buy_price, dec!(102));
        assert_eq!(ledger.targets.stop_loss_price, dec!(92));
        assert_eq!(ledger.targets.profit_price, dec!(115));
    }

    #[test]
    fn test_buy_adds_pyramiding_lot() {
        let p = processor();
        let ledger = scenario_a(&p);

        assert_eq!(ledger.total_shares, dec!(18));
        assert_eq!(ledger.holdings.len(), 2);
        assert_eq!(ledger.holdings[1].phase, 1);
        assert_eq!(ledger.holdings[1].shares, dec!(8));
        assert_eq!(ledger.targets.current_phase, Some(1));
        assert_eq!(ledger.targets.stop_loss_price, dec!(100.98));
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_buy_tolerance_band() {
        let p = processor();
        let targets = PyramidConfig::default()
            .model
            .phase_targets(dec!(100), dec!(10))
            .unwrap();

        // Below the base band: still the base phase
        assert_eq!(p.target_phase(&targets, dec!(95)), 0);
        // Just under phase 1's price but inside the 1% band (102 * 0.99 = 100.98)
        assert_eq!(p.target_phase(&targets, dec!(100.98)), 1);
        assert_eq!(p.target_phase(&targets, dec!(100.97)), 0);
        // Past every phase
        assert_eq!(p.target_phase(&targets, dec!(120)), 2);
    }

    #[test]
    fn test_buy_below_phase_keeps_holdings_sorted() {
        let p = processor();
        let ledger = scenario_a(&p);
        let ledger = p.buy(&ledger, dec!(99), dec!(5), at(3)).unwrap();

        let phases: Vec<_> = ledger.holdings.iter().map(|h| h.phase).collect();
        assert_eq!(phases, vec![0, 0, 1]);
        assert_eq!(ledger.total_shares, dec!(23));
        // Top holding is still the PYRAMIDING_1 lot
        assert_eq!(ledger.targets.current_phase, Some(1));
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_sell_consumes_highest_phase_first() {
        let p = processor();
        let ledger = scenario_a(&p);
        let ledger = p.sell(&ledger, dec!(104), dec!(12), at(3)).unwrap();

        assert_eq!(ledger.total_shares, dec!(6));
        assert_eq!(
            ledger.holdings,
            vec![Holding { phase: 0, shares: dec!(6), price: dec!(100) }]
        );
        assert_eq!(ledger.targets.current_phase, Some(0));
        assert_eq!(ledger.targets.next_buy_price, dec!(102));
        assert!(ledger.check_invariants().is_ok());
    }

    #[test]
    fn test_sell_exact_lot() {
        let p = processor();
        let ledger = scenario_a(&p);
        let ledger = p.sell(&ledger, dec!(104), dec!(8), at(3)).unwrap();

        assert_eq!(ledger.holdings.len(), 1);
        assert_eq!(ledger.holdings[0].shares, dec!(10));
    }

    #[test]
    fn test_sell_all_closes_pyramid() {
        let p = processor();
        let ledger = scenario_a(&p);
        let ledger = p.sell(&ledger, dec!(104), dec!(18), at(3)).unwrap();

        assert_eq!(ledger.total_shares, Decimal::ZERO);
        assert!(ledger.holdings.is_empty());
        assert!(ledger.phase_targets.is_empty());
        assert_eq!(ledger.targets, PriceTargets::none());
        assert_eq!(ledger.transactions.len(), 3);
    }

    #[test]
    fn test_buy_after_flat_reanchors() {
        let p = processor();
        let ledger = scenario_a(&p);
        let flat = p.sell(&ledger, dec!(104), dec!(18), at(3)).unwrap();
        let reopened = p.buy(&flat, dec!(50), dec!(20), at(4)).unwrap();

        assert_eq!(reopened.phase_targets[0].price, dec!(50));
        assert_eq!(reopened.phase_targets[0].shares, dec!(20));
        assert_eq!(reopened.phase_targets[1].price, dec!(51));
        assert_eq!(
            reopened.holdings,
            vec![Holding { phase: 0, shares: dec!(20), price: dec!(50) }]
        );
        assert_eq!(reopened.targets.profit_price, dec!(57.5));
        assert_eq!(reopened.transactions.len(), 4);
    }

    #[test]
    fn test_oversell_rejected_without_change() {
        let p = processor();
        let ledger = scenario_a(&p);
        let before = ledger.clone();

        let err = p.sell(&ledger, dec!(104), dec!(19), at(3)).unwrap_err();
        assert!(matches!(err, PositionError::InsufficientShares { .. }));
        assert_eq!(ledger, before);
    }

    #[test]
    fn test_apply_validation() {
        let p = processor();

        let err = p
            .apply(None, &request(TradeAction::Buy, dec!(0), dec!(10)))
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));

        let err = p
            .apply(None, &request(TradeAction::Buy, dec!(100), dec!(-1)))
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));

        let err = p
            .apply(None, &request(TradeAction::Sell, dec!(100), dec!(1)))
            .unwrap_err();
        assert!(matches!(err, PositionError::NotFound { .. }));

        let mut empty_symbol = request(TradeAction::Buy, dec!(100), dec!(1));
        empty_symbol.symbol = " ".to_string();
        assert!(matches!(
            p.apply(None, &empty_symbol).unwrap_err(),
            PositionError::Validation(_)
        ));
    }

    #[test]
    fn test_share_sum_invariant_over_sequence() {
        let p = processor();
        let mut ledger = p.open("alice", "AAPL", dec!(100), dec!(10), at(1)).unwrap();

        let steps = [
            (TradeAction::Buy, dec!(102.5), dec!(6)),
            (TradeAction::Buy, dec!(106), dec!(4)),
            (TradeAction::Sell, dec!(107), dec!(5)),
            (TradeAction::Buy, dec!(101), dec!(3)),
            (TradeAction::Sell, dec!(99), dec!(11.5)),
            (TradeAction::Sell, dec!(98), dec!(6.5)),
        ];

        for (action, price, shares) in steps {
            let req = request(action, price, shares);
            ledger = p.apply(Some(&ledger), &req).unwrap();
            assert!(ledger.check_invariants().is_ok(), "{:?}", ledger);
        }

        assert_eq!(ledger.total_shares, Decimal::ZERO);
        assert_eq!(ledger.transactions.len(), 7);
    }

    #[test]
    fn test_resolve_timestamp() {
        let now = at(9);

        assert_eq!(resolve_timestamp(None, now), now);
        assert_eq!(resolve_timestamp(Some("not a date"), now), now);
        assert_eq!(resolve_timestamp(Some(""), now), now);
        assert_eq!(
            resolve_timestamp(Some("2024-03-01T15:00:00Z"), now),
            at(1)
        );
        assert_eq!(
            resolve_timestamp(Some("2024-03-02 15:00:00"), now),
            at(2)
        );
        assert_eq!(
            resolve_timestamp(Some("2024-03-05"), now),
            Utc.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_huge_price_rejected() {
        let p = processor();

        // The ladder fits, the 1.15 profit target does not
        let err = p
            .open("alice", "AAPL", dec!(70000000000000000000000000000), dec!(1), at(1))
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));

        // The next phase price does not fit
        let err = p
            .apply(
                None,
                &request(TradeAction::Buy, dec!(78000000000000000000000000000), dec!(1)),
            )
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));
    }

    #[test]
    fn test_share_total_overflow_rejected() {
        let p = processor();
        let ledger = p
            .open("alice", "AAPL", dec!(100), dec!(70000000000000000000000000000), at(1))
            .unwrap();
        let before = ledger.clone();

        let err = p
            .buy(&ledger, dec!(100), dec!(70000000000000000000000000000), at(2))
            .unwrap_err();
        assert!(matches!(err, PositionError::Validation(_)));
        assert_eq!(ledger, before);
    }
}
