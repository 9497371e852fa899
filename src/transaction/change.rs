// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// Reversible record of one write made by a live session. The session applies
// writes eagerly and keeps these so a rollback can restore the source.
//
// ============================================================================

use crate::core::{Key, Tuple};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    /// `key` did not exist before.
    Insert { key: Key },

    /// `key` held `old` before the update.
    Update { key: Key, old: Tuple },

    /// `key` held `old` before it was deleted.
    Delete { key: Key, old: Tuple },
}

impl Change {
    pub fn key(&self) -> &Key {
        match self {
            Change::Insert { key } | Change::Update { key, .. } | Change::Delete { key, .. } => key,
        }
    }

    /// What `key` must be restored to when this change is undone:
    /// `None` means the key must be absent.
    pub fn restore_value(&self) -> Option<&Tuple> {
        match self {
            Change::Insert { .. } => None,
            Change::Update { old, .. } | Change::Delete { old, .. } => Some(old),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn key() -> Key {
        Key::new("Customer", vec![Value::Integer(1)])
    }

    #[test]
    fn test_restore_value() {
        assert_eq!(Change::Insert { key: key() }.restore_value(), None);

        let old = vec![Value::from("Ann")];
        let update = Change::Update { key: key(), old: old.clone() };
        assert_eq!(update.restore_value(), Some(&old));
        assert_eq!(update.key(), &key());
    }
}
