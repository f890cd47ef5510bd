use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use tally_core::{Category, CategoryRef, ProcessingStatus, RawRow, Transaction};

use crate::store::{StoreError, TransactionStore};

/// In-memory store for tests and dry runs. Preserves insertion order so
/// ordering guarantees can be asserted.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    transactions: Vec<Transaction>,
    rows: Vec<RawRow>,
    categories: Vec<Category>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub async fn seed_rows(&self, rows: Vec<RawRow>) {
        self.inner.lock().await.rows.extend(rows);
    }

    pub async fn seed_transactions(&self, transactions: Vec<Transaction>) {
        self.inner.lock().await.transactions.extend(transactions);
    }

    pub async fn seed_categories(&self, categories: Vec<Category>) {
        self.inner.lock().await.categories.extend(categories);
    }

    pub async fn all_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().await.transactions.clone()
    }

    pub async fn transaction_count(&self) -> usize {
        self.inner.lock().await.transactions.len()
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn read_source_rows(&self, source_id: &str) -> Result<Vec<RawRow>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .rows
            .iter()
            .filter(|r| r.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn find_by_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Transaction>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .transactions
            .iter()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn write_batch(&self, transactions: &[Transaction]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        for tx in transactions {
            let existing: HashMap<String, usize> = inner
                .transactions
                .iter()
                .enumerate()
                .map(|(i, t)| (t.id.clone(), i))
                .collect();
            match existing.get(&tx.id) {
                Some(&i) => inner.transactions[i] = tx.clone(),
                None => inner.transactions.push(tx.clone()),
            }
        }
        Ok(())
    }

    async fn update_category(
        &self,
        transaction_id: &str,
        category: &CategoryRef,
        is_manual: bool,
        confidence: Option<Decimal>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let tx = inner
            .transactions
            .iter_mut()
            .find(|t| t.id == transaction_id)
            .ok_or_else(|| StoreError::NotFound(transaction_id.to_string()))?;
        if is_manual {
            tx.category_manual = Some(category.clone());
        } else {
            tx.category_ai = Some(category.clone());
            tx.category_confidence = confidence;
            tx.status = ProcessingStatus::Categorised;
            tx.categorised_at = Some(chrono::Utc::now());
        }
        tx.modified_at = chrono::Utc::now();
        Ok(())
    }

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .categories
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }
}
