use super::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an entity: hierarchy name plus primary-key values.
///
/// Keys allocated while offline are marked `temporary` and never compare
/// equal to a persistent key, even when the values coincide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    entity_type: String,
    values: Vec<Value>,
    #[serde(default)]
    temporary: bool,
}

impl Key {
    pub fn new(entity_type: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values,
            temporary: false,
        }
    }

    /// Allocates a fresh temporary key for an entity created offline.
    pub fn temporary(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            values: vec![Value::Text(uuid::Uuid::new_v4().to_string())],
            temporary: true,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub(crate) fn remap_refs(&self, remap: &impl Fn(&Key) -> Key) -> Key {
        if !self.values.iter().any(|v| matches!(v, Value::Ref(_))) {
            return self.clone();
        }
        Self {
            entity_type: self.entity_type.clone(),
            values: self.values.iter().map(|v| v.remap_refs(remap)).collect(),
            temporary: self.temporary,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        if self.temporary {
            write!(f, "{}~[{}]", self.entity_type, values)
        } else {
            write!(f, "{}[{}]", self.entity_type, values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_keys_are_unique() {
        let a = Key::temporary("Customer");
        let b = Key::temporary("Customer");
        assert_ne!(a, b);
        assert!(a.is_temporary());
    }

    #[test]
    fn test_temporary_never_equals_persistent() {
        let temp = Key::temporary("Customer");
        let persistent = Key::new("Customer", temp.values().to_vec());
        assert_ne!(temp, persistent);
    }

    #[test]
    fn test_display() {
        let key = Key::new("Order", vec![Value::Integer(3)]);
        assert_eq!(key.to_string(), "Order[3]");
    }
}
