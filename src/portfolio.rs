//! Portfolio service: the load, process, save path behind every buy and sell.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};

use crate::clock::Clock;
use crate::db::PositionStore;
use crate::error::PositionError;
use crate::models::{
    Holding, PositionLedger, PriceTargets, TradeAction, TransactionRecord, TransactionRequest,
};
use crate::trading::{resolve_timestamp, PyramidConfig, TransactionProcessor};

/// What a caller gets back after a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionOutcome {
    pub holdings: Vec<Holding>,
    pub next_target: PriceTargets,

    /// Most recent first
    pub transactions: Vec<TransactionRecord>,
}

/// One row of a user's open positions.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub total_shares: Decimal,
    pub phase: String,
    pub next_price_target: Decimal,
    pub stop_loss_price: Decimal,
    pub profit_price: Decimal,
}

pub struct PortfolioService {
    store: Arc<dyn PositionStore>,
    processor: TransactionProcessor,
    config: PyramidConfig,
    clock: Arc<dyn Clock>,
}

impl PortfolioService {
    pub fn new(store: Arc<dyn PositionStore>, config: PyramidConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            processor: TransactionProcessor::new(config.clone()),
            config,
            clock,
        }
    }

    /// Apply a buy or sell and persist the new ledger with its targets.
    ///
    /// Nothing is written unless the transaction is valid, and a failed write
    /// discards the new ledger. The caller retries the whole call.
    pub async fn apply_transaction(
        &self,
        user: &str,
        symbol: &str,
        action: &str,
        price: Decimal,
        shares: Decimal,
        timestamp: Option<&str>,
    ) -> Result<TransactionOutcome, PositionError> {
        let action: TradeAction = action.parse()?;
        let symbol = symbol.trim().to_uppercase();

        let request = TransactionRequest {
            user: user.trim().to_string(),
            symbol,
            action,
            price,
            shares,
            timestamp: resolve_timestamp(timestamp, self.clock.now()),
        };

        let existing = self.store.get(&request.user, &request.symbol).await?;
        if existing.is_none() && action == TradeAction::Buy {
            info!(user = %request.user, symbol = %request.symbol, "Opening new position");
        }

        let mut ledger = self.processor.apply(existing.as_ref(), &request)?;
        // Back-dated trades keep their own timestamp; the record was still written now
        ledger.updated_at = self.clock.now();

        if let Err(e) = self.store.put(&ledger).await {
            error!(
                user = %request.user,
                symbol = %request.symbol,
                error = %e,
                "Unable to save position, transaction discarded"
            );
            return Err(e.into());
        }

        info!(
            user = %request.user,
            symbol = %request.symbol,
            action = %action,
            price = %price,
            shares = %shares,
            total_shares = %ledger.total_shares,
            "Transaction applied"
        );

        Ok(TransactionOutcome {
            next_target: ledger.targets,
            transactions: ledger.recent_transactions(),
            holdings: ledger.holdings,
        })
    }

    pub async fn get_position(&self, user: &str, symbol: &str) -> Result<PositionLedger, PositionError> {
        let user = user.trim();
        let symbol = symbol.trim().to_uppercase();
        self.store
            .get(user, &symbol)
            .await?
            .ok_or_else(|| PositionError::NotFound {
                user: user.to_string(),
                symbol,
            })
    }

    /// Open positions of a user with their current targets.
    pub async fn user_positions(&self, user: &str) -> Result<Vec<PositionSummary>, PositionError> {
        let ledgers = self.store.list_user(user.trim()).await?;

        Ok(ledgers
            .into_iter()
            .filter(|l| l.is_open())
            .map(|l| {
                let phase = l
                    .targets
                    .current_phase
                    .and_then(|i| self.config.model.name_of(i))
                    .unwrap_or("-")
                    .to_string();
                PositionSummary {
                    symbol: l.symbol,
                    total_shares: l.total_shares,
                    phase,
                    next_price_target: l.targets.next_buy_price,
                    stop_loss_price: l.targets.stop_loss_price,
                    profit_price: l.targets.profit_price,
                }
            })
            .collect())
    }
}
