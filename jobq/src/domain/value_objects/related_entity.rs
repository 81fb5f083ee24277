//! Related entity value object.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Reference to an entity outside the queue that a job is associated with.
///
/// The queue only stores and looks up these references; what they point to
/// belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedEntity {
    class: String,
    id: String,
}

impl RelatedEntity {
    /// Both the type tag and the identifier must be non-empty; an entity
    /// without a stable identity cannot be associated with a job.
    pub fn new(class: impl Into<String>, id: impl Into<String>) -> Result<Self> {
        let class = class.into();
        let id = id.into();

        if class.trim().is_empty() {
            return Err(Error::validation("related entity type must not be empty"));
        }
        if id.trim().is_empty() {
            return Err(Error::validation(format!(
                "related entity of type '{}' has no identifier",
                class
            )));
        }

        Ok(Self { class, id })
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for RelatedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_related_entity() {
        let entity = RelatedEntity::new("Invoice", "42").unwrap();
        assert_eq!(entity.class(), "Invoice");
        assert_eq!(entity.id(), "42");
        assert_eq!(entity.to_string(), "Invoice#42");
    }

    #[test]
    fn test_missing_identity_is_rejected() {
        assert!(matches!(
            RelatedEntity::new("Invoice", ""),
            Err(Error::Validation(_))
        ));
        assert!(RelatedEntity::new("", "42").is_err());
    }
}
