use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier scoping one normalization or categorization run. Caches
/// (exchange rates, duplicate index) live and die with one of these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessingRunId(String);

impl ProcessingRunId {
    pub fn generate() -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        ProcessingRunId(format!("{stamp}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessingRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(
            ProcessingRunId::generate().as_str(),
            ProcessingRunId::generate().as_str()
        );
    }

    #[test]
    fn id_has_timestamp_prefix() {
        let id = ProcessingRunId::generate();
        let (stamp, _) = id.as_str().split_once('-').unwrap();
        assert_eq!(stamp.len(), 14);
        assert!(stamp.chars().all(|c| c.is_ascii_digit()));
    }
}
