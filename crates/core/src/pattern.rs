use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::category::CategoryRef;
use super::transaction::{ProcessingStatus, Transaction};

/// Read-only projection of a previously categorized transaction, used as
/// evidence when categorizing new ones. It owns no storage of its own;
/// its lifetime is the lifetime of the underlying transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalPattern {
    pub transaction_id: String,
    pub description: String,
    pub category: CategoryRef,
    /// Whether the category came from a human correction rather than the AI.
    pub is_manual: bool,
    pub confidence: Option<Decimal>,
    pub amount: Decimal,
    pub date: NaiveDate,
}

impl HistoricalPattern {
    /// Projects a transaction into a pattern, or None when it carries no
    /// usable categorization (uncategorized, or stuck in Unprocessed/Error).
    pub fn from_transaction(tx: &Transaction) -> Option<Self> {
        if matches!(
            tx.status,
            ProcessingStatus::Unprocessed | ProcessingStatus::Error
        ) {
            return None;
        }
        let category = tx.effective_category()?.clone();
        Some(HistoricalPattern {
            transaction_id: tx.id.clone(),
            description: tx.description.clone(),
            category,
            is_manual: tx.has_manual_override(),
            confidence: tx.category_confidence,
            amount: tx.original_amount,
            date: tx.transaction_date,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionType;

    fn tx(status: ProcessingStatus) -> Transaction {
        let mut t = Transaction::new(
            "ref-9".to_string(),
            "monzo".to_string(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            TransactionType::Debit,
            "Tesco Stores".to_string(),
            Decimal::new(2250, 2),
            "GBP".to_string(),
        );
        t.status = status;
        t
    }

    #[test]
    fn projects_manual_category_over_ai() {
        let mut t = tx(ProcessingStatus::Categorised);
        t.category_ai = Some(CategoryRef {
            id: "shopping".to_string(),
            name: "Shopping".to_string(),
        });
        t.category_manual = Some(CategoryRef {
            id: "groceries".to_string(),
            name: "Groceries".to_string(),
        });
        let p = HistoricalPattern::from_transaction(&t).unwrap();
        assert_eq!(p.category.id, "groceries");
        assert!(p.is_manual);
    }

    #[test]
    fn uncategorized_yields_none() {
        assert!(HistoricalPattern::from_transaction(&tx(ProcessingStatus::Normalised)).is_none());
    }

    #[test]
    fn error_status_yields_none() {
        let mut t = tx(ProcessingStatus::Error);
        t.category_ai = Some(CategoryRef {
            id: "x".to_string(),
            name: "X".to_string(),
        });
        assert!(HistoricalPattern::from_transaction(&t).is_none());
    }
}
