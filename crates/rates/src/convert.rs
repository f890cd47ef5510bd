use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use tally_core::{ProcessingRunId, Transaction};
use tally_retry::{RetryError, RetryPolicy};

use crate::provider::{RateError, RateProvider};

/// A rate fetched once for one processing run; every transaction in the run
/// sharing the currency uses the same snapshot.
#[derive(Debug, Clone)]
pub struct ExchangeRateSnapshot {
    pub from_currency: String,
    pub rate: Decimal,
    pub provider: String,
    pub fetched_at: DateTime<Utc>,
    pub processing_run_id: ProcessingRunId,
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub amount: Decimal,
    /// None when the transaction was already in the reporting currency.
    pub rate: Option<Decimal>,
}

#[derive(Debug, Clone, Error)]
pub enum ConvertError {
    #[error("Exchange rate for {currency} unavailable after {attempts} attempts: {message}")]
    RateUnavailable {
        currency: String,
        attempts: u32,
        message: String,
    },
    #[error("Exchange rate lookup failed for {currency}: {message}")]
    Rate { currency: String, message: String },
}

impl ConvertError {
    fn from_retry(currency: &str, err: RetryError<RateError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => ConvertError::RateUnavailable {
                currency: currency.to_string(),
                attempts,
                message: source.to_string(),
            },
            RetryError::Aborted { source } => ConvertError::Rate {
                currency: currency.to_string(),
                message: source.to_string(),
            },
        }
    }
}

/// Converts native-currency amounts into the reporting currency, fetching
/// each distinct currency's rate at most once per run.
pub struct CurrencyConverter<P: RateProvider> {
    provider: P,
    policy: RetryPolicy,
    reporting_currency: String,
    run_id: ProcessingRunId,
    cache: HashMap<String, ExchangeRateSnapshot>,
}

impl<P: RateProvider> CurrencyConverter<P> {
    pub fn new(
        provider: P,
        policy: RetryPolicy,
        reporting_currency: &str,
        run_id: ProcessingRunId,
    ) -> Self {
        CurrencyConverter {
            provider,
            policy,
            reporting_currency: reporting_currency.to_string(),
            run_id,
            cache: HashMap::new(),
        }
    }

    pub fn reporting_currency(&self) -> &str {
        &self.reporting_currency
    }

    /// Snapshots fetched so far in this run, for audit logging.
    pub fn snapshots(&self) -> impl Iterator<Item = &ExchangeRateSnapshot> {
        self.cache.values()
    }

    pub async fn convert(&mut self, tx: &Transaction) -> Result<Conversion, ConvertError> {
        if tx.original_currency == self.reporting_currency {
            return Ok(Conversion {
                amount: tx.original_amount,
                rate: None,
            });
        }
        let rate = self.rate_for(&tx.original_currency).await?;
        Ok(Conversion {
            amount: tx.original_amount * rate,
            rate: Some(rate),
        })
    }

    /// Converts a whole batch with O(distinct currencies) external calls:
    /// the distinct-currency set is resolved first, then applied per
    /// transaction. A currency whose fetch fails poisons only its own
    /// transactions.
    pub async fn convert_batch(
        &mut self,
        transactions: &[Transaction],
    ) -> HashMap<String, Result<Conversion, ConvertError>> {
        let needed: BTreeSet<&str> = transactions
            .iter()
            .map(|t| t.original_currency.as_str())
            .filter(|c| *c != self.reporting_currency)
            .collect();

        let mut failures: HashMap<String, ConvertError> = HashMap::new();
        for currency in needed {
            if let Err(e) = self.rate_for(currency).await {
                failures.insert(currency.to_string(), e);
            }
        }

        let mut results = HashMap::new();
        for tx in transactions {
            let result = if let Some(err) = failures.get(&tx.original_currency) {
                Err(err.clone())
            } else if tx.original_currency == self.reporting_currency {
                Ok(Conversion {
                    amount: tx.original_amount,
                    rate: None,
                })
            } else {
                // Cache hit by construction.
                let rate = self.cache[&tx.original_currency].rate;
                Ok(Conversion {
                    amount: tx.original_amount * rate,
                    rate: Some(rate),
                })
            };
            results.insert(tx.id.clone(), result);
        }
        results
    }

    async fn rate_for(&mut self, currency: &str) -> Result<Decimal, ConvertError> {
        if let Some(snapshot) = self.cache.get(currency) {
            debug!(currency, "rate cache hit");
            return Ok(snapshot.rate);
        }

        let provider = &self.provider;
        let to = self.reporting_currency.clone();
        let quote = self
            .policy
            .run_if(
                "fetch_exchange_rate",
                RateError::is_retryable,
                || provider.get_rate(currency, &to),
            )
            .await
            .map_err(|e| ConvertError::from_retry(currency, e))?;

        info!(
            currency,
            rate = %quote.rate,
            provider = %quote.provider,
            run = %self.run_id,
            "exchange rate fetched"
        );
        self.cache.insert(
            currency.to_string(),
            ExchangeRateSnapshot {
                from_currency: currency.to_string(),
                rate: quote.rate,
                provider: quote.provider,
                fetched_at: quote.fetched_at,
                processing_run_id: self.run_id.clone(),
            },
        );
        Ok(quote.rate)
    }
}
