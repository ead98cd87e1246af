//! Queue names: the tag that routes a job to its handler.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// A validated, non-empty queue name (e.g. `extract_brand_colors`).
///
/// All jobs share one backlog; the queue name only selects the handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("queue name must not be empty"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for QueueName {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_regular_names() {
        let q = QueueName::new("extract_brand_colors").unwrap();
        assert_eq!(q.as_str(), "extract_brand_colors");
        assert_eq!(q.to_string(), "extract_brand_colors");
    }

    #[test]
    fn rejects_empty_and_blank_names() {
        assert!(matches!(QueueName::new(""), Err(DomainError::Validation(_))));
        assert!(matches!(QueueName::new("   "), Err(DomainError::Validation(_))));
    }

    #[test]
    fn deserialization_validates() {
        let ok: QueueName = serde_json::from_str("\"emails\"").unwrap();
        assert_eq!(ok.as_str(), "emails");
        assert!(serde_json::from_str::<QueueName>("\"\"").is_err());
    }
}
