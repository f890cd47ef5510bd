use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

/// "Not found" and "transient failure" are kept distinguishable so the retry
/// predicate can discriminate.
#[derive(Debug, Clone, Error)]
pub enum RateError {
    #[error("No rate published for {from}->{to}")]
    NotFound { from: String, to: String },
    #[error("Rate service unavailable: {0}")]
    Transient(String),
    #[error("Invalid rate payload: {0}")]
    Invalid(String),
}

impl RateError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RateError::Transient(_))
    }
}

#[derive(Debug, Clone)]
pub struct RateQuote {
    /// 1 unit of the base currency = `rate` units of the target currency.
    pub rate: Decimal,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn get_rate(&self, from: &str, to: &str) -> Result<RateQuote, RateError>;

    /// One quote per base currency. The default implementation loops; an
    /// adapter with a real batch endpoint can do better.
    async fn get_rates_batch(
        &self,
        from: &[String],
        to: &str,
    ) -> Result<HashMap<String, RateQuote>, RateError> {
        let mut quotes = HashMap::new();
        for currency in from {
            quotes.insert(currency.clone(), self.get_rate(currency, to).await?);
        }
        Ok(quotes)
    }
}

// ── HTTP adapter ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LatestRatesResponse {
    rates: HashMap<String, f64>,
}

/// Reference adapter for exchangerate.host-style services:
/// `GET {base}/latest?base=EUR&symbols=GBP` returning `{"rates":{"GBP":0.86}}`.
pub struct HttpRateProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRateProvider {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(HttpRateProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn get_rate(&self, from: &str, to: &str) -> Result<RateQuote, RateError> {
        let url = format!("{}/latest?base={from}&symbols={to}", self.base_url);
        tracing::debug!(from, to, "fetching exchange rate");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RateError::Transient(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RateError::NotFound {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if !status.is_success() {
            return Err(RateError::Transient(format!("HTTP {status}")));
        }

        let body: LatestRatesResponse = response
            .json()
            .await
            .map_err(|e| RateError::Invalid(e.to_string()))?;

        let raw = body.rates.get(to).copied().ok_or_else(|| RateError::NotFound {
            from: from.to_string(),
            to: to.to_string(),
        })?;
        let rate = Decimal::from_f64(raw)
            .ok_or_else(|| RateError::Invalid(format!("unrepresentable rate {raw}")))?;

        Ok(RateQuote {
            rate,
            provider: self.base_url.clone(),
            fetched_at: Utc::now(),
        })
    }
}

// ── Mock adapter ──────────────────────────────────────────────────────────────

/// Scripted provider for tests: fixed rates, a call counter for asserting
/// fetch minimality, and an optional run of leading transient failures.
#[derive(Default)]
pub struct MockRateProvider {
    rates: HashMap<String, Decimal>,
    calls: AtomicU32,
    transient_failures: AtomicU32,
}

impl MockRateProvider {
    pub fn new() -> Self {
        MockRateProvider::default()
    }

    pub fn with_rate(mut self, from: &str, rate: Decimal) -> Self {
        self.rates.insert(from.to_string(), rate);
        self
    }

    /// The first `n` calls fail with a transient error.
    pub fn failing_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RateProvider for MockRateProvider {
    async fn get_rate(&self, from: &str, to: &str) -> Result<RateQuote, RateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(RateError::Transient("scripted outage".to_string()));
        }

        match self.rates.get(from) {
            Some(rate) => Ok(RateQuote {
                rate: *rate,
                provider: "mock".to_string(),
                fetched_at: Utc::now(),
            }),
            None => Err(RateError::NotFound {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_provider_builds_with_timeout() {
        let provider = HttpRateProvider::new("https://rates.example/");
        assert!(provider.is_ok());
        assert_eq!(provider.unwrap().base_url, "https://rates.example");
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RateError::Transient("503".to_string()).is_retryable());
        assert!(!RateError::NotFound {
            from: "XXX".to_string(),
            to: "GBP".to_string()
        }
        .is_retryable());
        assert!(!RateError::Invalid("bad json".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn mock_counts_calls_and_scripts_failures() {
        let provider = MockRateProvider::new()
            .with_rate("EUR", Decimal::new(86, 2))
            .failing_first(1);

        assert!(matches!(
            provider.get_rate("EUR", "GBP").await,
            Err(RateError::Transient(_))
        ));
        let quote = provider.get_rate("EUR", "GBP").await.unwrap();
        assert_eq!(quote.rate, Decimal::new(86, 2));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn mock_unknown_currency_is_not_found() {
        let provider = MockRateProvider::new();
        assert!(matches!(
            provider.get_rate("XYZ", "GBP").await,
            Err(RateError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn batch_default_impl_covers_all_currencies() {
        let provider = MockRateProvider::new()
            .with_rate("EUR", Decimal::new(86, 2))
            .with_rate("USD", Decimal::new(79, 2));
        let quotes = provider
            .get_rates_batch(&["EUR".to_string(), "USD".to_string()], "GBP")
            .await
            .unwrap();
        assert_eq!(quotes.len(), 2);
    }
}
