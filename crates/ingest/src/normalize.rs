use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use tally_core::{ProcessingRunId, ProcessingStatus, Transaction};
use tally_rates::{CurrencyConverter, RateProvider};
use tally_storage::{StoreError, TransactionStore};

use crate::dedup::DuplicateIndex;
use crate::source::{MapError, SourceProfile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceCounts {
    pub total_rows: usize,
    pub normalized: usize,
    pub duplicates: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct NormalizationOutcome {
    pub run_id: ProcessingRunId,
    /// Counts broken down by bank source, in source-id order.
    pub per_source: BTreeMap<String, SourceCounts>,
    /// Human-readable failure messages; populated even when the run as a
    /// whole succeeds.
    pub messages: Vec<String>,
}

impl NormalizationOutcome {
    pub fn source(&self, source_id: &str) -> SourceCounts {
        self.per_source.get(source_id).copied().unwrap_or_default()
    }

    pub fn total_rows(&self) -> usize {
        self.sum(|c| c.total_rows)
    }

    pub fn normalized(&self) -> usize {
        self.sum(|c| c.normalized)
    }

    pub fn duplicates(&self) -> usize {
        self.sum(|c| c.duplicates)
    }

    pub fn errors(&self) -> usize {
        self.sum(|c| c.errors)
    }

    fn sum(&self, f: impl Fn(&SourceCounts) -> usize) -> usize {
        self.per_source.values().map(f).sum()
    }
}

/// Drives one normalization pass: raw rows -> canonical transactions ->
/// dedup -> currency conversion -> persist, continuing past per-row
/// failures. The duplicate index and rate cache live exactly as long as the
/// run.
pub struct NormalizationRun<'a, S: TransactionStore, P: RateProvider> {
    store: &'a S,
    converter: CurrencyConverter<P>,
    index: DuplicateIndex,
    /// Error records from earlier runs, keyed by bank reference. A
    /// re-ingested key found here takes over the stale record instead of
    /// minting a new one.
    recoverable: HashMap<String, Transaction>,
    run_id: ProcessingRunId,
}

impl<'a, S: TransactionStore, P: RateProvider> NormalizationRun<'a, S, P> {
    /// Builds the duplicate index and the recoverable-error map from every
    /// previously ingested transaction before any new row is looked at.
    pub async fn new(
        store: &'a S,
        converter: CurrencyConverter<P>,
        run_id: ProcessingRunId,
    ) -> Result<NormalizationRun<'a, S, P>, StoreError> {
        let mut existing = store.find_by_status(ProcessingStatus::Normalised).await?;
        existing.extend(store.find_by_status(ProcessingStatus::Categorised).await?);
        let index = DuplicateIndex::from_existing(existing.iter());

        let recoverable: HashMap<String, Transaction> = store
            .find_by_status(ProcessingStatus::Error)
            .await?
            .into_iter()
            .map(|t| (t.original_transaction_id.clone(), t))
            .collect();

        info!(
            run = %run_id,
            known = index.len(),
            recoverable = recoverable.len(),
            "duplicate index built"
        );
        Ok(NormalizationRun {
            store,
            converter,
            index,
            recoverable,
            run_id,
        })
    }

    pub async fn execute(
        mut self,
        profiles: &[SourceProfile],
    ) -> Result<NormalizationOutcome, StoreError> {
        let mut outcome = NormalizationOutcome {
            run_id: self.run_id.clone(),
            per_source: BTreeMap::new(),
            messages: Vec::new(),
        };

        for profile in profiles {
            let entry = outcome.per_source.entry(profile.source_id.clone()).or_default();
            if let Err(e) = profile.validate() {
                warn!(source = %profile.source_id, error = %e, "skipping invalid source profile");
                entry.errors += 1;
                outcome.messages.push(e.to_string());
                continue;
            }
            let (counts, messages) = self.process_source(profile).await?;
            entry.total_rows += counts.total_rows;
            entry.normalized += counts.normalized;
            entry.duplicates += counts.duplicates;
            entry.errors += counts.errors;
            outcome.messages.extend(messages);
        }

        info!(
            run = %self.run_id,
            total = outcome.total_rows(),
            normalized = outcome.normalized(),
            duplicates = outcome.duplicates(),
            errors = outcome.errors(),
            "normalization run finished"
        );
        Ok(outcome)
    }

    async fn process_source(
        &mut self,
        profile: &SourceProfile,
    ) -> Result<(SourceCounts, Vec<String>), StoreError> {
        let mut counts = SourceCounts::default();
        let mut messages = Vec::new();

        let rows = self.store.read_source_rows(&profile.source_id).await?;
        counts.total_rows = rows.len();
        debug!(source = %profile.source_id, rows = rows.len(), "read source rows");

        // Map and deduplicate in read order.
        let mut candidates: Vec<Transaction> = Vec::new();
        for row in &rows {
            let tx = match profile.map_row(row).and_then(|tx| {
                tx.validate().map(|_| tx).map_err(|e| MapError::InvalidRow {
                    row: row.row_number,
                    reason: e.to_string(),
                })
            }) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(source = %profile.source_id, row = row.row_number, error = %e, "row rejected");
                    counts.errors += 1;
                    messages.push(e.to_string());
                    continue;
                }
            };

            if let Some(existing) = self.index.is_duplicate(&tx) {
                debug!(
                    source = %profile.source_id,
                    reference = %tx.original_transaction_id,
                    existing,
                    "duplicate skipped"
                );
                counts.duplicates += 1;
                continue;
            }
            let tx = match self.recoverable.remove(&tx.original_transaction_id) {
                Some(stale) => revive(stale, tx),
                None => tx,
            };
            self.index.register(&tx);
            candidates.push(tx);
        }

        if candidates.is_empty() {
            return Ok((counts, messages));
        }

        // One rate fetch per distinct currency; a failed currency poisons
        // only its own transactions.
        let conversions = self.converter.convert_batch(&candidates).await;
        for tx in &mut candidates {
            match conversions.get(&tx.id) {
                Some(Ok(conversion)) => {
                    tx.reporting_amount = Some(conversion.amount);
                    tx.exchange_rate = conversion.rate;
                    if tx.set_status(ProcessingStatus::Normalised).is_ok() {
                        counts.normalized += 1;
                    }
                }
                Some(Err(e)) => {
                    warn!(reference = %tx.original_transaction_id, error = %e, "conversion failed");
                    // A revived record is already at Error; the transition
                    // is a no-op then.
                    let _ = tx.set_status(ProcessingStatus::Error);
                    counts.errors += 1;
                    messages.push(e.to_string());
                }
                None => {
                    // convert_batch returns an entry per input; treat a gap
                    // as a conversion failure.
                    let _ = tx.set_status(ProcessingStatus::Error);
                    counts.errors += 1;
                    messages.push(format!("no conversion result for {}", tx.id));
                }
            }
        }

        self.store.write_batch(&candidates).await?;
        Ok((counts, messages))
    }
}

/// A re-ingested row whose previous attempt ended in Error takes over the
/// stale record, keeping its id and creation time, so the ledger never holds
/// two rows for one bank reference.
fn revive(stale: Transaction, mut fresh: Transaction) -> Transaction {
    fresh.id = stale.id;
    fresh.created_at = stale.created_at;
    fresh.status = stale.status;
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use tally_core::RawRow;
    use tally_rates::MockRateProvider;
    use tally_retry::RetryPolicy;
    use tally_storage::MemoryStore;

    use crate::source::ColumnMapping;

    fn profile_for(source_id: &str) -> SourceProfile {
        SourceProfile {
            source_id: source_id.to_string(),
            name: source_id.to_string(),
            default_currency: "GBP".to_string(),
            mapping: ColumnMapping {
                reference_column: Some(0),
                date_column: 1,
                description_column: 2,
                amount_column: 3,
                currency_column: Some(4),
                ..ColumnMapping::default()
            },
        }
    }

    fn profile() -> SourceProfile {
        profile_for("monzo")
    }

    fn row_for(source_id: &str, n: usize, fields: &[&str]) -> RawRow {
        RawRow::new(source_id, n, fields.iter().map(|s| s.to_string()).collect())
    }

    fn row(n: usize, fields: &[&str]) -> RawRow {
        row_for("monzo", n, fields)
    }

    async fn run_with(
        store: &MemoryStore,
        provider: MockRateProvider,
        profiles: &[SourceProfile],
    ) -> NormalizationOutcome {
        let converter = CurrencyConverter::new(
            provider,
            RetryPolicy::default(),
            "GBP",
            ProcessingRunId::generate(),
        );
        NormalizationRun::new(store, converter, ProcessingRunId::generate())
            .await
            .unwrap()
            .execute(profiles)
            .await
            .unwrap()
    }

    async fn run(store: &MemoryStore, provider: MockRateProvider) -> NormalizationOutcome {
        run_with(store, provider, &[profile()]).await
    }

    #[tokio::test]
    async fn happy_path_normalizes_and_persists() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![
                row(1, &["tx-1", "2024-03-10", "TESCO", "-12.99", "GBP"]),
                row(2, &["tx-2", "2024-03-11", "UBER", "-9.50", "GBP"]),
            ])
            .await;

        let outcome = run(&store, MockRateProvider::new()).await;
        assert_eq!(outcome.total_rows(), 2);
        assert_eq!(outcome.normalized(), 2);
        assert_eq!(outcome.duplicates(), 0);
        assert_eq!(outcome.errors(), 0);

        let stored = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        // Same currency: passthrough, no rate.
        assert_eq!(stored[0].reporting_amount, Some(Decimal::new(1299, 2)));
        assert!(stored[0].exchange_rate.is_none());
        // Read order preserved.
        assert_eq!(stored[0].original_transaction_id, "tx-1");
        assert_eq!(stored[1].original_transaction_id, "tx-2");
    }

    #[tokio::test]
    async fn counts_are_reported_per_source() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![
                row(1, &["tx-1", "2024-03-10", "TESCO", "-12.99", "GBP"]),
                row(2, &["tx-2", "not-a-date", "UBER", "-9.50", "GBP"]),
                row_for("starling", 1, &["st-1", "2024-03-10", "GREGGS", "-3.10", "GBP"]),
            ])
            .await;

        let outcome = run_with(
            &store,
            MockRateProvider::new(),
            &[profile(), profile_for("starling")],
        )
        .await;

        assert_eq!(
            outcome.source("monzo"),
            SourceCounts {
                total_rows: 2,
                normalized: 1,
                duplicates: 0,
                errors: 1,
            }
        );
        assert_eq!(
            outcome.source("starling"),
            SourceCounts {
                total_rows: 1,
                normalized: 1,
                duplicates: 0,
                errors: 0,
            }
        );
        assert_eq!(outcome.total_rows(), 3);
        assert_eq!(outcome.normalized(), 2);
        assert_eq!(outcome.errors(), 1);
    }

    #[tokio::test]
    async fn second_run_is_pure_duplicates() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![
                row(1, &["tx-1", "2024-03-10", "TESCO", "-12.99", "GBP"]),
                row(2, &["tx-2", "2024-03-11", "UBER", "-9.50", "GBP"]),
            ])
            .await;

        let first = run(&store, MockRateProvider::new()).await;
        assert_eq!(first.normalized(), 2);

        let second = run(&store, MockRateProvider::new()).await;
        assert_eq!(second.normalized(), 0);
        assert_eq!(second.duplicates(), 2);
        assert_eq!(second.source("monzo").duplicates, 2);
        assert_eq!(store.transaction_count().await, 2);
    }

    #[tokio::test]
    async fn identical_row_resubmitted_reports_one_duplicate() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![row(1, &["tx-1", "2024-03-10", "HOTEL", "-100.00", "EUR"])])
            .await;

        let provider = MockRateProvider::new().with_rate("EUR", Decimal::new(86, 2));
        let first = run(&store, provider).await;
        assert_eq!(first.normalized(), 1);

        let provider = MockRateProvider::new().with_rate("EUR", Decimal::new(86, 2));
        let second = run(&store, provider).await;
        assert_eq!(second.duplicates(), 1);
        assert_eq!(second.normalized(), 0);
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn bad_rows_are_skipped_without_aborting() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![
                row(1, &["tx-1", "not-a-date", "TESCO", "-12.99", "GBP"]),
                row(2, &["tx-2", "2024-03-11", "UBER", "-9.50", "GBP"]),
                row(3, &["tx-3", "2024-03-12", "", "-1.00", "GBP"]),
            ])
            .await;

        let outcome = run(&store, MockRateProvider::new()).await;
        assert_eq!(outcome.normalized(), 1);
        assert_eq!(outcome.errors(), 2);
        assert_eq!(outcome.messages.len(), 2);
        // Failures are reported against their rows.
        assert!(outcome.messages[0].starts_with("Row 1"));
        assert!(outcome.messages[1].starts_with("Row 3"));
        assert_eq!(store.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn failed_currency_marks_only_its_transactions_error() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![
                row(1, &["tx-1", "2024-03-10", "HOTEL", "-100.00", "EUR"]),
                row(2, &["tx-2", "2024-03-11", "SOUVENIR", "-5.00", "XXX"]),
                row(3, &["tx-3", "2024-03-12", "TESCO", "-12.99", "GBP"]),
            ])
            .await;

        let provider = MockRateProvider::new().with_rate("EUR", Decimal::new(86, 2));
        let outcome = run(&store, provider).await;

        assert_eq!(outcome.normalized(), 2);
        assert_eq!(outcome.errors(), 1);
        assert!(outcome.messages[0].contains("XXX"));

        let errored = store.find_by_status(ProcessingStatus::Error).await.unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].original_transaction_id, "tx-2");

        let normalized = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(normalized.len(), 2);
        let eur = normalized
            .iter()
            .find(|t| t.original_currency == "EUR")
            .unwrap();
        assert_eq!(eur.reporting_amount, Some(Decimal::new(8600, 2)));
        assert_eq!(eur.exchange_rate, Some(Decimal::new(86, 2)));
    }

    #[tokio::test]
    async fn failed_conversion_recovers_in_place_on_reingestion() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![row(1, &["tx-1", "2024-03-10", "HOTEL", "-100.00", "XXX"])])
            .await;

        // No XXX rate: the row lands in Error.
        let first = run(&store, MockRateProvider::new()).await;
        assert_eq!(first.errors(), 1);
        let errored = store.find_by_status(ProcessingStatus::Error).await.unwrap();
        assert_eq!(errored.len(), 1);
        let stale_id = errored[0].id.clone();

        // The rate exists now: the stale record is taken over, not
        // duplicated, and no Error row lingers.
        let provider = MockRateProvider::new().with_rate("XXX", Decimal::new(50, 2));
        let second = run(&store, provider).await;
        assert_eq!(second.normalized(), 1);
        assert_eq!(second.duplicates(), 0);

        assert_eq!(store.transaction_count().await, 1);
        assert!(store
            .find_by_status(ProcessingStatus::Error)
            .await
            .unwrap()
            .is_empty());
        let normalized = store
            .find_by_status(ProcessingStatus::Normalised)
            .await
            .unwrap();
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].id, stale_id);
        assert_eq!(normalized[0].reporting_amount, Some(Decimal::new(5000, 2)));
    }

    #[tokio::test]
    async fn reingestion_that_fails_again_keeps_one_error_record() {
        let store = MemoryStore::new();
        store
            .seed_rows(vec![row(1, &["tx-1", "2024-03-10", "HOTEL", "-100.00", "XXX"])])
            .await;

        let first = run(&store, MockRateProvider::new()).await;
        assert_eq!(first.errors(), 1);

        let second = run(&store, MockRateProvider::new()).await;
        assert_eq!(second.errors(), 1);

        let errored = store.find_by_status(ProcessingStatus::Error).await.unwrap();
        assert_eq!(errored.len(), 1);
        assert_eq!(store.transaction_count().await, 1);
    }
}
