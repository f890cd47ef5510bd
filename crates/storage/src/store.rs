use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use tally_core::{Category, CategoryRef, ProcessingStatus, RawRow, Transaction};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Transaction not found: {0}")]
    NotFound(String),
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Persistence port. The pipeline assumes only that reads return a snapshot
/// and that writes are durable before the next run starts, never a
/// particular backing technology.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Raw, unmapped rows waiting for normalization from one bank source.
    async fn read_source_rows(&self, source_id: &str) -> Result<Vec<RawRow>, StoreError>;

    async fn find_by_status(
        &self,
        status: ProcessingStatus,
    ) -> Result<Vec<Transaction>, StoreError>;

    /// Upserts by transaction id.
    async fn write_batch(&self, transactions: &[Transaction]) -> Result<(), StoreError>;

    async fn update_category(
        &self,
        transaction_id: &str,
        category: &CategoryRef,
        is_manual: bool,
        confidence: Option<Decimal>,
    ) -> Result<(), StoreError>;

    async fn list_categories(&self) -> Result<Vec<Category>, StoreError>;
}
