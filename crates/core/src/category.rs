use serde::{Deserialize, Serialize};

/// Lightweight id/name pair stamped onto transactions. The full `Category`
/// definition (description, examples) only matters to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Example merchant strings, fed to the classifier as few-shot hints.
    pub examples: Vec<String>,
    pub is_active: bool,
}

impl Category {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Category {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            examples: Vec::new(),
            is_active: true,
        }
    }

    pub fn to_ref(&self) -> CategoryRef {
        CategoryRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}
