use super::VersionSet;
use crate::core::{DbError, EntityModel, Key, Result, Tuple};
use crate::operations::ReplayObserver;
use std::sync::Arc;
use tracing::{Level, event};

/// Fails a replay when an entity it touches changed in the live source since
/// its version was recorded.
pub struct VersionValidator {
    model: Arc<EntityModel>,
    expected: VersionSet,
    checked: usize,
}

impl VersionValidator {
    pub fn new(model: Arc<EntityModel>, expected: VersionSet) -> Self {
        Self {
            model,
            expected,
            checked: 0,
        }
    }

    pub fn checked(&self) -> usize {
        self.checked
    }
}

impl ReplayObserver for VersionValidator {
    fn entity_fetched(&mut self, key: &Key, tuple: Option<&Tuple>) -> Result<()> {
        let expected = self.expected.get(key);
        if expected.is_void() {
            return Ok(());
        }
        self.checked += 1;

        let Some(tuple) = tuple else {
            event!(Level::DEBUG, key = %key, "versioned entity gone from source");
            return Err(DbError::VersionConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: "(removed)".to_string(),
            });
        };

        let actual = self.model.extract_version(key, tuple)?;
        if &actual != expected {
            return Err(DbError::VersionConflict {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DataType, FieldInfo, TypeInfo, Value, VersionInfo};

    fn model() -> Arc<EntityModel> {
        Arc::new(EntityModel::new().with_type(TypeInfo::new(
            "Customer",
            vec![
                FieldInfo::new("name", DataType::Text),
                FieldInfo::new("version", DataType::Integer).versioned(),
            ],
        )))
    }

    fn key(id: i64) -> Key {
        Key::new("Customer", vec![Value::Integer(id)])
    }

    fn validator() -> VersionValidator {
        let mut expected = VersionSet::new();
        expected.add(key(1), VersionInfo::new(vec![Value::Integer(3)]), true);
        VersionValidator::new(model(), expected)
    }

    #[test]
    fn test_matching_version_passes() {
        let mut validator = validator();
        let tuple = vec![Value::from("Ann"), Value::Integer(3)];
        validator.entity_fetched(&key(1), Some(&tuple)).unwrap();
        assert_eq!(validator.checked(), 1);
    }

    #[test]
    fn test_changed_version_conflicts() {
        let mut validator = validator();
        let tuple = vec![Value::from("Ann"), Value::Integer(4)];
        let err = validator.entity_fetched(&key(1), Some(&tuple)).unwrap_err();
        assert!(err.is_version_conflict());
    }

    #[test]
    fn test_missing_entity_conflicts() {
        let mut validator = validator();
        assert!(validator.entity_fetched(&key(1), None).unwrap_err().is_version_conflict());
    }

    #[test]
    fn test_unversioned_entity_is_skipped() {
        let mut validator = validator();
        validator.entity_fetched(&key(2), None).unwrap();
        assert_eq!(validator.checked(), 0);
    }
}
