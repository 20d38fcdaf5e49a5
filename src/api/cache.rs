//! In-memory quote cache in front of a slow, rate-limited quote provider.
//!
//! Handles:
//! - Serving quotes younger than the TTL without a request
//! - Fetching misses with bounded exponential backoff
//! - Refreshing every cached symbol in the background during market hours

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::FeedError;

use super::types::Quote;
use super::{PriceFeed, QuoteFetcher};

/// Cache and retry settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a cached quote is served without refetching
    pub ttl: Duration,

    /// Interval between background refresh rounds
    pub refresh_interval: Duration,

    /// Delay between symbols within a refresh round
    pub pacing: Duration,

    /// Retries after the first failed attempt of a fetch
    pub max_retries: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// Background refresh only runs on weekdays in [open, close) UTC
    pub market_open_hour_utc: u32,
    pub market_close_hour_utc: u32,

    /// Symbols nobody asked for in this long are dropped instead of refreshed
    pub evict_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
            refresh_interval: Duration::from_secs(5 * 60),
            pacing: Duration::from_millis(500),
            max_retries: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            market_open_hour_utc: 13,
            market_close_hour_utc: 21,
            evict_after: Duration::from_secs(6 * 5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedQuote {
    quote: Quote,
    fetched_at: DateTime<Utc>,

    /// Last time a caller asked for this symbol
    requested_at: DateTime<Utc>,
}

/// Quote cache owned by the process. Stop its refresh task with [`RefreshHandle::shutdown`].
pub struct PriceCache<F> {
    fetcher: F,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    entries: RwLock<HashMap<String, CachedQuote>>,
}

impl<F: QuoteFetcher> PriceCache<F> {
    pub fn new(fetcher: F, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            fetcher,
            clock,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached quote if it is still within the TTL.
    pub async fn cached(&self, symbol: &str) -> Option<Quote> {
        let entries = self.entries.read().await;
        let entry = entries.get(symbol)?;

        within(self.clock.now() - entry.fetched_at, self.config.ttl).then(|| entry.quote.clone())
    }

    /// Mark a symbol as still wanted by a caller.
    async fn touch(&self, symbol: &str) {
        let now = self.clock.now();
        if let Some(entry) = self.entries.write().await.get_mut(symbol) {
            entry.requested_at = now;
        }
    }

    pub async fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.entries.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Save a fetched quote. `requested` marks a caller asking for it rather than a refresh.
    async fn store(&self, quote: Quote, requested: bool) {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;

        match entries.get_mut(&quote.symbol) {
            Some(entry) => {
                entry.quote = quote;
                entry.fetched_at = now;
                if requested {
                    entry.requested_at = now;
                }
            }
            None => {
                entries.insert(
                    quote.symbol.clone(),
                    CachedQuote {
                        quote,
                        fetched_at: now,
                        requested_at: now,
                    },
                );
            }
        }
    }

    /// Drop symbols no caller asked for within `evict_after`. Returns how many were dropped.
    pub async fn evict_idle(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();

        entries.retain(|symbol, entry| {
            let keep = within(now - entry.requested_at, self.config.evict_after);
            if !keep {
                debug!(symbol = %symbol, "Evicting idle quote");
            }
            keep
        });

        before - entries.len()
    }

    /// Fetch from the provider, retrying transient failures with exponential backoff.
    pub async fn fetch_with_retry(&self, symbol: &str) -> Result<Quote, FeedError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff)
            .with_max_interval(self.config.max_backoff)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();

        let max_retries = self.config.max_retries;
        let mut attempts = 0u32;

        let result = backoff::future::retry(policy, || {
            attempts += 1;
            let attempt = attempts;
            async move {
                match self.fetcher.fetch_quote(symbol).await {
                    Ok(quote) => Ok(quote),
                    Err(e) if e.is_transient() && attempt <= max_retries => {
                        warn!(symbol = %symbol, attempt = attempt, error = %e, "Quote fetch failed, backing off");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        result.map_err(|e| {
            if e.is_transient() {
                FeedError::Exhausted {
                    symbol: symbol.to_string(),
                    attempts,
                    last: e.to_string(),
                }
            } else {
                e
            }
        })
    }

    /// Whether `now` falls in the configured trading window.
    pub fn is_market_hours(&self, now: DateTime<Utc>) -> bool {
        let weekday = !matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = now.hour();
        weekday
            && hour >= self.config.market_open_hour_utc
            && hour < self.config.market_close_hour_utc
    }

    /// Refetch every cached symbol once. Returns how many were refreshed.
    ///
    /// Cancellation also interrupts a fetch that is backing off.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> usize {
        let evicted = self.evict_idle().await;
        let symbols = self.symbols().await;
        let mut refreshed = 0;

        for (i, symbol) in symbols.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.pacing) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(symbol = %symbol, "Refresh cancelled mid-fetch");
                    break;
                }
                result = self.fetch_with_retry(symbol) => result,
            };

            match result {
                Ok(quote) => {
                    self.store(quote, false).await;
                    refreshed += 1;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Unable to refresh quote, keeping cached value");
                }
            }
        }

        info!(
            refreshed = refreshed,
            evicted = evicted,
            total = symbols.len(),
            "Price cache refresh complete"
        );
        refreshed
    }
}

/// Whether `age` is still inside `limit`.
fn within(age: chrono::Duration, limit: Duration) -> bool {
    chrono::Duration::from_std(limit)
        .map(|limit| age < limit)
        .unwrap_or(true)
}

impl<F: QuoteFetcher + 'static> PriceCache<F> {
    /// Start the background refresh task.
    pub fn spawn_refresh(self: &Arc<Self>, cancel: CancellationToken) -> RefreshHandle {
        let cache = Arc::clone(self);
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!("Starting price cache refresh");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(cache.config.refresh_interval) => {}
                }

                if !cache.is_market_hours(cache.clock.now()) {
                    debug!("Outside market hours, skipping price refresh");
                    continue;
                }

                cache.refresh_all(&token).await;
            }
            info!("Price cache refresh stopped");
        });

        RefreshHandle { cancel, handle }
    }
}

#[async_trait]
impl<F: QuoteFetcher> PriceFeed for PriceCache<F> {
    async fn get_price(&self, symbol: &str) -> Result<Quote, FeedError> {
        if let Some(quote) = self.cached(symbol).await {
            self.touch(symbol).await;
            debug!(symbol = %symbol, "Quote served from cache");
            return Ok(quote);
        }

        let quote = self.fetch_with_retry(symbol).await?;
        self.store(quote.clone(), true).await;
        Ok(quote)
    }
}

/// Owner of a running refresh task.
pub struct RefreshHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    /// Signal the task and wait for it to finish its current symbol.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Price refresh task ended abnormally");
        }
    }
}
