//! Quote model and Alpha Vantage response types.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Latest price of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: Decimal,

    /// Change since the previous close
    #[serde(default)]
    pub change: Decimal,

    /// Change as a fraction of the previous close
    #[serde(default)]
    pub change_pct: Decimal,

    /// Market date the price belongs to
    pub as_of: DateTime<Utc>,
}

/// Response of the `TIME_SERIES_DAILY` function.
#[derive(Debug, Clone, Deserialize)]
pub struct DailySeriesResponse {
    /// Bars keyed by `YYYY-MM-DD`, which sorts chronologically
    #[serde(rename = "Time Series (Daily)", default)]
    pub series: BTreeMap<String, DailyBar>,

    /// Throttle notice on the free tier
    #[serde(rename = "Note")]
    pub note: Option<String>,

    #[serde(rename = "Information")]
    pub information: Option<String>,

    #[serde(rename = "Error Message")]
    pub error_message: Option<String>,
}

/// One daily bar. Only the close is used.
#[derive(Debug, Clone, Deserialize)]
pub struct DailyBar {
    #[serde(rename = "4. close")]
    pub close: Decimal,
}

impl DailySeriesResponse {
    /// Latest close and its change against the previous one.
    pub fn into_quote(self, symbol: &str) -> Result<Quote, FeedError> {
        if let Some(msg) = self.error_message {
            return Err(FeedError::Provider(msg));
        }
        if let Some(msg) = self.note.or(self.information) {
            return Err(FeedError::RateLimited(msg));
        }

        let mut bars = self.series.into_iter().rev();
        let (date, latest) = bars
            .next()
            .ok_or_else(|| FeedError::NoData(symbol.to_string()))?;

        let as_of = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .ok_or_else(|| FeedError::Provider(format!("bad bar date '{}'", date)))?;

        let (change, change_pct) = match bars.next() {
            Some((_, prev)) if !prev.close.is_zero() => {
                let change = latest.close - prev.close;
                (change, change / prev.close)
            }
            _ => (Decimal::ZERO, Decimal::ZERO),
        };

        Ok(Quote {
            symbol: symbol.to_string(),
            price: latest.close,
            change,
            change_pct,
            as_of,
        })
    }
}
