use serde::{Deserialize, Serialize};

/// One raw row as delivered by a bank source, before any mapping. Fields are
/// positional; the per-source profile decides what each position means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    pub source_id: String,
    /// 1-based position within the source read, for error messages.
    pub row_number: usize,
    pub fields: Vec<String>,
}

impl RawRow {
    pub fn new(source_id: &str, row_number: usize, fields: Vec<String>) -> Self {
        RawRow {
            source_id: source_id.to_string(),
            row_number,
            fields,
        }
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(|s| s.as_str())
    }
}
