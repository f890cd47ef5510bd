pub mod category;
pub mod config;
pub mod pattern;
pub mod run;
pub mod source;
pub mod transaction;

pub use category::{Category, CategoryRef};
pub use config::{ConfigError, MatcherSettings, PipelineConfig, RetrySettings};
pub use pattern::HistoricalPattern;
pub use run::ProcessingRunId;
pub use source::RawRow;
pub use transaction::{ProcessingStatus, Transaction, TransactionError, TransactionType};
