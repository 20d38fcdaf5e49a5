//! Price feed: quote provider client, quote cache and the traits between them.

mod alpha_vantage;
mod cache;
mod types;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::FeedError;

pub use alpha_vantage::AlphaVantageClient;
pub use cache::{CacheConfig, PriceCache};
pub use types::Quote;

/// Where the price evaluation gets its prices from.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn get_price(&self, symbol: &str) -> Result<Quote, FeedError>;
}

/// One uncached request to a quote provider.
#[async_trait]
pub trait QuoteFetcher: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, FeedError>;
}

#[async_trait]
impl<T: QuoteFetcher + ?Sized> QuoteFetcher for Arc<T> {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
        (**self).fetch_quote(symbol).await
    }
}
