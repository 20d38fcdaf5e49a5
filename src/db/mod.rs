//! Persistence of position ledgers.
//!
//! One row per (user, symbol). Holdings, phase targets and the transaction log
//! are JSON columns that name phases rather than index them, so a row stays
//! readable if the ladder is reordered. The derived target columns are written
//! in the same statement as the ledger they were computed from.
//!
//! `put` is a whole-row replace and last writer wins. Two concurrent
//! load-process-save sequences on the same key can lose an update; nothing
//! here serializes them.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::debug;

use crate::error::StoreError;
use crate::models::{
    Holding, PhaseTarget, PositionLedger, PriceTargets, PyramidModel, TransactionRecord,
};

/// Key of one stored ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PositionKey {
    pub user: String,
    pub symbol: String,
}

/// Keyed record store for position ledgers.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, user: &str, symbol: &str) -> Result<Option<PositionLedger>, StoreError>;

    /// Replace every field of the ledger's record, or fail without writing anything.
    async fn put(&self, ledger: &PositionLedger) -> Result<(), StoreError>;

    /// All keys in a stable order.
    async fn keys(&self) -> Result<Vec<PositionKey>, StoreError>;

    async fn list_user(&self, user: &str) -> Result<Vec<PositionLedger>, StoreError>;
}

/// SQLite-backed ledger store.
pub struct Database {
    pool: SqlitePool,
    model: PyramidModel,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub username: String,
    pub symbol: String,
    pub total_shares: String,
    pub phase_targets: String,
    pub holdings: String,
    pub transactions: String,
    pub current_phase: Option<String>,
    pub next_buy_price: String,
    pub next_buy_shares: String,
    pub stop_loss_price: String,
    pub profit_price: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredHolding {
    phase: String,
    shares: Decimal,
    price: Decimal,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPhaseTarget {
    phase: String,
    price: Decimal,
    shares: Decimal,
    stop_loss_price: Decimal,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str, model: PyramidModel) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let db = Self { pool, model };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory(model: PyramidModel) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool, model };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                username TEXT NOT NULL,
                symbol TEXT NOT NULL,
                total_shares TEXT NOT NULL,
                phase_targets TEXT NOT NULL DEFAULT '[]',
                holdings TEXT NOT NULL DEFAULT '[]',
                transactions TEXT NOT NULL DEFAULT '[]',
                current_phase TEXT,
                next_buy_price TEXT NOT NULL DEFAULT '0',
                next_buy_shares TEXT NOT NULL DEFAULT '0',
                stop_loss_price TEXT NOT NULL DEFAULT '0',
                profit_price TEXT NOT NULL DEFAULT '0',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (username, symbol)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_symbol ON positions(symbol)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn phase_name(&self, index: usize) -> Result<&str, StoreError> {
        self.model
            .name_of(index)
            .ok_or_else(|| StoreError::UnknownPhase(format!("#{}", index)))
    }

    fn phase_index(&self, name: &str) -> Result<usize, StoreError> {
        self.model
            .index_of(name)
            .ok_or_else(|| StoreError::UnknownPhase(name.to_string()))
    }

    fn encode_holdings(&self, holdings: &[Holding]) -> Result<String, StoreError> {
        let stored = holdings
            .iter()
            .map(|h| {
                Ok(StoredHolding {
                    phase: self.phase_name(h.phase)?.to_string(),
                    shares: h.shares,
                    price: h.price,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(serde_json::to_string(&stored)?)
    }

    fn encode_phase_targets(&self, targets: &[PhaseTarget]) -> Result<String, StoreError> {
        let stored = targets
            .iter()
            .enumerate()
            .map(|(i, t)| {
                Ok(StoredPhaseTarget {
                    phase: self.phase_name(i)?.to_string(),
                    price: t.price,
                    shares: t.shares,
                    stop_loss_price: t.stop_loss_price,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(serde_json::to_string(&stored)?)
    }

    fn decode(&self, row: StoredPosition) -> Result<PositionLedger, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            user: row.username.clone(),
            symbol: row.symbol.clone(),
            reason,
        };

        let stored_holdings: Vec<StoredHolding> = serde_json::from_str(&row.holdings)?;
        let holdings = stored_holdings
            .into_iter()
            .map(|h| {
                Ok(Holding {
                    phase: self.phase_index(&h.phase)?,
                    shares: h.shares,
                    price: h.price,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let stored_targets: Vec<StoredPhaseTarget> = serde_json::from_str(&row.phase_targets)?;
        let mut indexed = stored_targets
            .into_iter()
            .map(|t| {
                Ok((
                    self.phase_index(&t.phase)?,
                    PhaseTarget {
                        price: t.price,
                        shares: t.shares,
                        stop_loss_price: t.stop_loss_price,
                    },
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        indexed.sort_by_key(|(i, _)| *i);

        if indexed.iter().enumerate().any(|(pos, (i, _))| pos != *i) {
            return Err(corrupt("phase targets are not contiguous".to_string()));
        }
        let phase_targets = indexed.into_iter().map(|(_, t)| t).collect();

        let transactions: Vec<TransactionRecord> = serde_json::from_str(&row.transactions)?;

        let current_phase = row
            .current_phase
            .as_deref()
            .map(|name| self.phase_index(name))
            .transpose()?;

        let ledger = PositionLedger {
            user: row.username.clone(),
            symbol: row.symbol.clone(),
            total_shares: parse_decimal("total_shares", &row.total_shares)?,
            phase_targets,
            holdings,
            transactions,
            targets: PriceTargets {
                current_phase,
                next_buy_price: parse_decimal("next_buy_price", &row.next_buy_price)?,
                next_buy_shares: parse_decimal("next_buy_shares", &row.next_buy_shares)?,
                stop_loss_price: parse_decimal("stop_loss_price", &row.stop_loss_price)?,
                profit_price: parse_decimal("profit_price", &row.profit_price)?,
            },
            updated_at: row.updated_at,
        };

        ledger.check_invariants().map_err(corrupt)?;

        Ok(ledger)
    }
}

#[async_trait]
impl PositionStore for Database {
    async fn get(&self, user: &str, symbol: &str) -> Result<Option<PositionLedger>, StoreError> {
        let row = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE username = ? AND symbol = ?",
        )
        .bind(user)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| self.decode(r)).transpose()
    }

    async fn put(&self, ledger: &PositionLedger) -> Result<(), StoreError> {
        // Encode everything before touching the database
        let phase_targets = self.encode_phase_targets(&ledger.phase_targets)?;
        let holdings = self.encode_holdings(&ledger.holdings)?;
        let transactions = serde_json::to_string(&ledger.transactions)?;
        let current_phase = ledger
            .targets
            .current_phase
            .map(|i| self.phase_name(i).map(str::to_string))
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO positions (
                username, symbol, total_shares, phase_targets, holdings, transactions,
                current_phase, next_buy_price, next_buy_shares, stop_loss_price,
                profit_price, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(username, symbol) DO UPDATE SET
                total_shares = excluded.total_shares,
                phase_targets = excluded.phase_targets,
                holdings = excluded.holdings,
                transactions = excluded.transactions,
                current_phase = excluded.current_phase,
                next_buy_price = excluded.next_buy_price,
                next_buy_shares = excluded.next_buy_shares,
                stop_loss_price = excluded.stop_loss_price,
                profit_price = excluded.profit_price,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&ledger.user)
        .bind(&ledger.symbol)
        .bind(ledger.total_shares.to_string())
        .bind(phase_targets)
        .bind(holdings)
        .bind(transactions)
        .bind(current_phase)
        .bind(ledger.targets.next_buy_price.to_string())
        .bind(ledger.targets.next_buy_shares.to_string())
        .bind(ledger.targets.stop_loss_price.to_string())
        .bind(ledger.targets.profit_price.to_string())
        .bind(ledger.updated_at)
        .execute(&self.pool)
        .await?;

        debug!(user = %ledger.user, symbol = %ledger.symbol, "Saved position");
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<PositionKey>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT username, symbol FROM positions ORDER BY username, symbol")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(user, symbol)| PositionKey { user, symbol })
            .collect())
    }

    async fn list_user(&self, user: &str) -> Result<Vec<PositionLedger>, StoreError> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE username = ? ORDER BY symbol",
        )
        .bind(user)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|r| self.decode(r)).collect()
    }
}

fn parse_decimal(column: &'static str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|_| StoreError::InvalidDecimal {
        column,
        value: value.to_string(),
    })
}
