//! Ingestion side of the pipeline: source profiles map raw bank rows into
//! canonical transactions, the duplicate index keeps re-submitted exports
//! out, and the normalization run ties mapping, dedup, and currency
//! conversion together.

pub mod dedup;
pub mod normalize;
pub mod source;

pub use dedup::{DedupCounters, DuplicateIndex};
pub use normalize::{NormalizationOutcome, NormalizationRun, SourceCounts};
pub use source::{read_csv_rows, ColumnMapping, MapError, SourceProfile};
