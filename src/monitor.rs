//! Price evaluation driver.
//!
//! Walks every stored position, looks up a price and compares it with the
//! position's targets. The ledger is never mutated here; an alert only tells the
//! user which trade the pyramid calls for.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::PriceFeed;
use crate::db::{PositionKey, PositionStore};
use crate::error::{FeedError, PositionError};
use crate::models::{PriceTargets, TradeAction};
use crate::notify::Notifier;
use crate::trading::TargetCalculator;

/// Why a signal was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SignalKind {
    TakeProfit,
    NextPhase,
    StopLoss,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::TakeProfit => write!(f, "take profit"),
            SignalKind::NextPhase => write!(f, "next phase"),
            SignalKind::StopLoss => write!(f, "stop loss"),
        }
    }
}

/// Trade suggested by a price crossing one of the targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub action: TradeAction,
    pub kind: SignalKind,

    /// The target that was crossed
    pub threshold: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub user: String,
    pub symbol: String,
    pub signal: Signal,
    pub price: Decimal,
}

impl Alert {
    pub fn message(&self) -> String {
        match self.signal.kind {
            SignalKind::TakeProfit => format!(
                "SELL {}: price {} reached the profit target {}",
                self.symbol, self.price, self.signal.threshold
            ),
            SignalKind::NextPhase => format!(
                "BUY {}: price {} reached the next pyramiding level {}",
                self.symbol, self.price, self.signal.threshold
            ),
            SignalKind::StopLoss => format!(
                "SELL {}: price {} fell below the stop loss {}",
                self.symbol, self.price, self.signal.threshold
            ),
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Delay between two records, to stay under the feed's rate limit
    pub pacing: Duration,

    /// Longest wait for one price before the record is skipped
    pub price_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pacing: Duration::from_secs(1),
            price_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub skipped_flat: usize,
    pub alerts: usize,
    pub feed_failures: usize,
    pub store_failures: usize,
    pub cancelled: bool,
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Scanned:          {}", self.scanned)?;
        writeln!(f, "Flat (skipped):   {}", self.skipped_flat)?;
        writeln!(f, "Alerts:           {}", self.alerts)?;
        writeln!(f, "Feed failures:    {}", self.feed_failures)?;
        writeln!(f, "Store failures:   {}", self.store_failures)?;
        write!(f, "Cancelled:        {}", if self.cancelled { "Yes" } else { "No" })
    }
}

/// Pick at most one signal for a price. Profit beats the next buy, which beats
/// the stop loss.
pub fn evaluate(targets: &PriceTargets, price: Decimal) -> Option<Signal> {
    if targets.current_phase.is_none() {
        return None;
    }

    if price >= targets.profit_price {
        return Some(Signal {
            action: TradeAction::Sell,
            kind: SignalKind::TakeProfit,
            threshold: targets.profit_price,
        });
    }

    if targets.next_buy_price > Decimal::ZERO && price >= targets.next_buy_price {
        return Some(Signal {
            action: TradeAction::Buy,
            kind: SignalKind::NextPhase,
            threshold: targets.next_buy_price,
        });
    }

    if price < targets.stop_loss_price {
        return Some(Signal {
            action: TradeAction::Sell,
            kind: SignalKind::StopLoss,
            threshold: targets.stop_loss_price,
        });
    }

    None
}

enum Outcome {
    Flat,
    Quiet,
    Alerted,
}

pub struct PriceMonitor {
    store: Arc<dyn PositionStore>,
    feed: Arc<dyn PriceFeed>,
    notifier: Arc<dyn Notifier>,
    calculator: TargetCalculator,
    config: MonitorConfig,
}

impl PriceMonitor {
    pub fn new(
        store: Arc<dyn PositionStore>,
        feed: Arc<dyn PriceFeed>,
        notifier: Arc<dyn Notifier>,
        calculator: TargetCalculator,
        config: MonitorConfig,
    ) -> Self {
        Self {
            store,
            feed,
            notifier,
            calculator,
            config,
        }
    }

    /// One pass over every stored position.
    ///
    /// Only an unknown phase in a stored record ends the pass early with an
    /// error. Cancellation is honored between records.
    pub async fn scan(&self, cancel: &CancellationToken) -> Result<ScanReport, PositionError> {
        let keys = self.store.keys().await?;
        let mut report = ScanReport::default();

        info!(positions = keys.len(), "Starting price scan");

        for (i, key) in keys.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            if i > 0 && !self.config.pacing.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(self.config.pacing) => {}
                }
            }

            report.scanned += 1;

            match self.check(key).await {
                Ok(Outcome::Flat) => report.skipped_flat += 1,
                Ok(Outcome::Quiet) => {}
                Ok(Outcome::Alerted) => report.alerts += 1,
                Err(ScanError::Feed(e)) => {
                    warn!(user = %key.user, symbol = %key.symbol, error = %e, "Price unavailable, skipping");
                    report.feed_failures += 1;
                }
                Err(ScanError::Position(e)) if e.is_fatal() => {
                    error!(user = %key.user, symbol = %key.symbol, error = %e, "Aborting scan");
                    return Err(e);
                }
                Err(ScanError::Position(e)) => {
                    warn!(user = %key.user, symbol = %key.symbol, error = %e, "Unreadable position, skipping");
                    report.store_failures += 1;
                }
            }
        }

        info!(
            scanned = report.scanned,
            alerts = report.alerts,
            feed_failures = report.feed_failures,
            store_failures = report.store_failures,
            cancelled = report.cancelled,
            "Price scan finished"
        );

        Ok(report)
    }

    async fn check(&self, key: &PositionKey) -> Result<Outcome, ScanError> {
        let Some(ledger) = self
            .store
            .get(&key.user, &key.symbol)
            .await
            .map_err(PositionError::from)?
        else {
            return Ok(Outcome::Flat);
        };

        if !ledger.is_open() {
            return Ok(Outcome::Flat);
        }

        let targets = self.calculator.compute(&ledger)?;

        let quote = tokio::time::timeout(self.config.price_timeout, self.feed.get_price(&key.symbol))
            .await
            .map_err(|_| FeedError::Timeout {
                symbol: key.symbol.clone(),
                after: self.config.price_timeout,
            })??;

        debug!(symbol = %key.symbol, price = %quote.price, "Evaluating position");

        let Some(signal) = evaluate(&targets, quote.price) else {
            return Ok(Outcome::Quiet);
        };

        let alert = Alert {
            user: key.user.clone(),
            symbol: key.symbol.clone(),
            signal,
            price: quote.price,
        };

        info!(
            user = %alert.user,
            symbol = %alert.symbol,
            action = %signal.action,
            kind = %signal.kind,
            price = %alert.price,
            threshold = %signal.threshold,
            "Target crossed"
        );

        if let Err(e) = self.notifier.notify(&alert.user, &alert.message()).await {
            warn!(user = %alert.user, symbol = %alert.symbol, error = %e, "Failed to deliver alert");
        }

        Ok(Outcome::Alerted)
    }
}

enum ScanError {
    Feed(FeedError),
    Position(PositionError),
}

impl From<FeedError> for ScanError {
    fn from(e: FeedError) -> Self {
        Self::Feed(e)
    }
}

impl From<PositionError> for ScanError {
    fn from(e: PositionError) -> Self {
        Self::Position(e)
    }
}
