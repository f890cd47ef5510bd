use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::category::CategoryRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Debit,
    Credit,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Debit => write!(f, "DEBIT"),
            TransactionType::Credit => write!(f, "CREDIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Unprocessed,
    Normalised,
    Categorised,
    Error,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::Unprocessed => "UNPROCESSED",
            ProcessingStatus::Normalised => "NORMALISED",
            ProcessingStatus::Categorised => "CATEGORISED",
            ProcessingStatus::Error => "ERROR",
        }
    }

    /// Forward-only lifecycle. Error is reachable from anywhere and may be
    /// retried back into Normalised; Categorised never regresses here
    /// (only `Transaction::reset_ai_category` can unwind it).
    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Unprocessed, Normalised)
                | (Normalised, Categorised)
                | (Error, Normalised)
                | (Unprocessed, Error)
                | (Normalised, Error)
                | (Categorised, Error)
        )
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UNPROCESSED" => Ok(ProcessingStatus::Unprocessed),
            "NORMALISED" => Ok(ProcessingStatus::Normalised),
            "CATEGORISED" => Ok(ProcessingStatus::Categorised),
            "ERROR" => Ok(ProcessingStatus::Error),
            other => Err(format!("Unknown processing status: '{other}'")),
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("Invalid transaction: {0}")]
    Validation(String),
    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },
}

/// Canonical transaction record. Raw source rows are mapped into this shape
/// during normalization; everything downstream operates on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Globally unique, assigned at normalization.
    pub id: String,
    /// Deduplication key: the bank-native reference, or a deterministic
    /// stand-in derived only from stable fields (never the amount or any
    /// rate-derived value).
    pub original_transaction_id: String,
    pub bank_source_id: String,
    pub transaction_date: NaiveDate,
    pub transaction_type: TransactionType,
    pub description: String,
    pub notes: Option<String>,
    pub country: Option<String>,
    pub original_amount: Decimal,
    pub original_currency: String,
    pub reporting_amount: Option<Decimal>,
    /// 1 unit of original currency = this many units of reporting currency.
    /// None when the transaction is already in the reporting currency.
    pub exchange_rate: Option<Decimal>,
    pub category_ai: Option<CategoryRef>,
    /// 0-100.
    pub category_confidence: Option<Decimal>,
    /// Human-assigned category; always wins over `category_ai` for reporting.
    pub category_manual: Option<CategoryRef>,
    pub status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub normalised_at: Option<DateTime<Utc>>,
    pub categorised_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(
        original_transaction_id: String,
        bank_source_id: String,
        transaction_date: NaiveDate,
        transaction_type: TransactionType,
        description: String,
        original_amount: Decimal,
        original_currency: String,
    ) -> Self {
        let now = Utc::now();
        Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            original_transaction_id,
            bank_source_id,
            transaction_date,
            transaction_type,
            description,
            notes: None,
            country: None,
            original_amount,
            original_currency,
            reporting_amount: None,
            exchange_rate: None,
            category_ai: None,
            category_confidence: None,
            category_manual: None,
            status: ProcessingStatus::Unprocessed,
            created_at: now,
            modified_at: now,
            normalised_at: None,
            categorised_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.original_transaction_id.trim().is_empty() {
            return Err(TransactionError::Validation(
                "missing original transaction id".to_string(),
            ));
        }
        if self.description.trim().is_empty() {
            return Err(TransactionError::Validation("missing description".to_string()));
        }
        if self.original_currency.trim().is_empty() {
            return Err(TransactionError::Validation("missing currency".to_string()));
        }
        if let Some(conf) = self.category_confidence {
            if conf < Decimal::ZERO || conf > Decimal::from(100) {
                return Err(TransactionError::Validation(format!(
                    "confidence {conf} outside [0, 100]"
                )));
            }
        }
        Ok(())
    }

    pub fn set_status(&mut self, next: ProcessingStatus) -> Result<(), TransactionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransactionError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            ProcessingStatus::Normalised => self.normalised_at = Some(now),
            ProcessingStatus::Categorised => self.categorised_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.modified_at = now;
        Ok(())
    }

    /// The one sanctioned way back from Categorised: clear every AI-assigned
    /// field and return to Normalised. Manual overrides are never touched.
    pub fn reset_ai_category(&mut self) {
        self.category_ai = None;
        self.category_confidence = None;
        self.categorised_at = None;
        if self.status == ProcessingStatus::Categorised {
            self.status = ProcessingStatus::Normalised;
        }
        self.modified_at = Utc::now();
    }

    pub fn apply_ai_category(
        &mut self,
        category: CategoryRef,
        confidence: Decimal,
    ) -> Result<(), TransactionError> {
        if confidence < Decimal::ZERO || confidence > Decimal::from(100) {
            return Err(TransactionError::Validation(format!(
                "confidence {confidence} outside [0, 100]"
            )));
        }
        self.category_ai = Some(category);
        self.category_confidence = Some(confidence);
        self.set_status(ProcessingStatus::Categorised)
    }

    /// Manual override first, AI second.
    pub fn effective_category(&self) -> Option<&CategoryRef> {
        self.category_manual.as_ref().or(self.category_ai.as_ref())
    }

    pub fn is_categorized(&self) -> bool {
        self.category_manual.is_some() || self.category_ai.is_some()
    }

    pub fn has_manual_override(&self) -> bool {
        self.category_manual.is_some()
    }
}
