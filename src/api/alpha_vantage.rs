//! Alpha Vantage client for daily closing prices.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::error::FeedError;

use super::types::{DailySeriesResponse, Quote};
use super::QuoteFetcher;

const ALPHA_VANTAGE_BASE: &str = "https://www.alphavantage.co";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the Alpha Vantage time series API.
pub struct AlphaVantageClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageClient {
    /// Create a new client with default settings.
    pub fn new(api_key: String) -> Result<Self> {
        Self::with_base_url(ALPHA_VANTAGE_BASE.to_string(), api_key)
    }

    /// Create against another host, such as a regional mirror or a local stub.
    pub fn with_base_url(base_url: String, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl QuoteFetcher for AlphaVantageClient {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
        let url = format!("{}/query", self.base_url);

        debug!(symbol = %symbol, "Fetching daily series");

        let response = self
            .client
            .get(&url)
            .query(&[
                ("function", "TIME_SERIES_DAILY"),
                ("symbol", symbol),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::RateLimited(status.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Provider(format!("{} - {}", status, body)));
        }

        let series: DailySeriesResponse = response.json().await?;
        series.into_quote(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(status: u16, body: &str) -> (AlphaVantageClient, MockServer) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/query"))
            .and(query_param("function", "TIME_SERIES_DAILY"))
            .and(query_param("symbol", "IBM"))
            .and(query_param("apikey", "demo"))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;

        let client = AlphaVantageClient::with_base_url(server.uri(), "demo".to_string()).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_daily_series_parsed() {
        let body = r#"{
            "Time Series (Daily)": {
                "2024-03-01": {"4. close": "185.03"},
                "2024-03-04": {"4. close": "191.95"}
            }
        }"#;
        let (client, _server) = client_for(200, body).await;

        let quote = client.fetch_quote("IBM").await.unwrap();
        assert_eq!(quote.symbol, "IBM");
        assert_eq!(quote.price, dec!(191.95));
        assert_eq!(quote.change, dec!(6.92));
    }

    #[tokio::test]
    async fn test_too_many_requests_is_throttle() {
        let (client, _server) = client_for(429, "slow down").await;

        let err = client.fetch_quote("IBM").await.unwrap_err();
        assert!(matches!(err, FeedError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_keeps_body() {
        let (client, _server) = client_for(500, "upstream exploded").await;

        let err = client.fetch_quote("IBM").await.unwrap_err();
        match err {
            FeedError::Provider(msg) => {
                assert!(msg.starts_with("500"));
                assert!(msg.contains("upstream exploded"));
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_throttle_note_in_ok_response() {
        let (client, _server) = client_for(200, r#"{"Note": "5 calls per minute"}"#).await;

        let err = client.fetch_quote("IBM").await.unwrap_err();
        assert!(matches!(err, FeedError::RateLimited(_)));
    }
}
