use std::collections::HashMap;

use tally_core::{ProcessingStatus, Transaction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupCounters {
    pub checked: u64,
    pub found: u64,
    pub unique: u64,
}

/// Hash-map lookup deciding whether a transaction has already been ingested.
/// Keyed by `original_transaction_id` verbatim: case-sensitive, no
/// normalization; the id itself must already be stable. Scoped to one
/// processing run and infallible: an absent key is simply not a duplicate.
#[derive(Debug, Default)]
pub struct DuplicateIndex {
    /// original_transaction_id -> canonical transaction id.
    seen: HashMap<String, String>,
    counters: DedupCounters,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        DuplicateIndex::default()
    }

    /// Builds the index from history. Only records that made it to
    /// Normalised or Categorised count; Unprocessed and Error records do not
    /// block re-ingestion. Historical keys never touch the run counters.
    pub fn from_existing<'a>(existing: impl IntoIterator<Item = &'a Transaction>) -> Self {
        let mut index = DuplicateIndex::new();
        for tx in existing {
            if matches!(
                tx.status,
                ProcessingStatus::Normalised | ProcessingStatus::Categorised
            ) {
                index
                    .seen
                    .entry(tx.original_transaction_id.clone())
                    .or_insert_with(|| tx.id.clone());
            }
        }
        index
    }

    /// Returns the canonical id of the already-ingested transaction, if any.
    pub fn is_duplicate(&mut self, tx: &Transaction) -> Option<&str> {
        self.counters.checked += 1;
        match self.seen.get(&tx.original_transaction_id) {
            Some(existing) => {
                self.counters.found += 1;
                Some(existing.as_str())
            }
            None => None,
        }
    }

    /// Idempotent: re-registering an existing key is a no-op, not an error.
    pub fn register(&mut self, tx: &Transaction) {
        if let std::collections::hash_map::Entry::Vacant(slot) =
            self.seen.entry(tx.original_transaction_id.clone())
        {
            slot.insert(tx.id.clone());
            self.counters.unique += 1;
        }
    }

    /// Unique subset in input order; the survivors are registered so
    /// in-batch duplicates are caught too.
    pub fn filter(&mut self, transactions: Vec<Transaction>) -> Vec<Transaction> {
        let mut unique = Vec::with_capacity(transactions.len());
        for tx in transactions {
            if self.is_duplicate(&tx).is_none() {
                self.register(&tx);
                unique.push(tx);
            }
        }
        unique
    }

    pub fn counters(&self) -> DedupCounters {
        self.counters
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
