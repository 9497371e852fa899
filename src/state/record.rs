use super::DifferentialSnapshot;
use crate::core::{DbError, Key, Result, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an entity as seen from one registry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Created in this layer (or below it) and unknown to the source.
    New,
    /// Has local field changes on top of its origin.
    Modified,
    /// Deleted locally; kept as a tombstone for diffing against the parent.
    Removed,
    /// Matches its origin.
    Synchronized,
    /// Local changes exist but the origin disappeared from the source.
    Inconsistent,
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceState::New => write!(f, "NEW"),
            PersistenceState::Modified => write!(f, "MODIFIED"),
            PersistenceState::Removed => write!(f, "REMOVED"),
            PersistenceState::Synchronized => write!(f, "SYNCHRONIZED"),
            PersistenceState::Inconsistent => write!(f, "INCONSISTENT"),
        }
    }
}

/// One entity in one registry layer. `snapshot == None` means removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    key: Key,
    snapshot: Option<DifferentialSnapshot>,
    state: PersistenceState,
}

impl EntityRecord {
    pub fn synchronized(key: Key, origin: Tuple) -> Self {
        Self {
            key,
            snapshot: Some(DifferentialSnapshot::new(origin)),
            state: PersistenceState::Synchronized,
        }
    }

    pub fn created(key: Key, values: Tuple) -> Self {
        Self {
            key,
            snapshot: Some(DifferentialSnapshot::detached(values)),
            state: PersistenceState::New,
        }
    }

    /// A local copy of an ancestor's current view, ready to take edits.
    pub(crate) fn derived(key: Key, ancestor_view: Tuple) -> Self {
        Self::synchronized(key, ancestor_view)
    }

    pub(crate) fn tombstone(key: Key) -> Self {
        Self {
            key,
            snapshot: None,
            state: PersistenceState::Removed,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn snapshot(&self) -> Option<&DifferentialSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn state(&self) -> PersistenceState {
        self.state
    }

    pub fn is_removed(&self) -> bool {
        self.snapshot.is_none()
    }

    /// Current field values; `None` for a removed entity.
    pub fn values(&self) -> Option<Tuple> {
        self.snapshot.as_ref().map(|snapshot| snapshot.merged())
    }

    pub fn read(&self, offset: usize) -> Option<&Value> {
        self.snapshot.as_ref().and_then(|snapshot| snapshot.read(offset))
    }

    pub fn write(&mut self, offset: usize, value: Value) -> Result<()> {
        let snapshot = self.snapshot.as_mut().ok_or_else(|| {
            DbError::InconsistentState(format!("cannot write to removed entity {}", self.key))
        })?;
        snapshot.write(offset, value);
        self.refresh_state();
        Ok(())
    }

    pub(crate) fn snapshot_mut(&mut self) -> Option<&mut DifferentialSnapshot> {
        self.snapshot.as_mut()
    }

    pub(crate) fn set_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    /// Re-derives Modified/Synchronized from the overlay. New and
    /// Inconsistent are sticky until the record is committed.
    pub(crate) fn refresh_state(&mut self) {
        if matches!(
            self.state,
            PersistenceState::Modified | PersistenceState::Synchronized
        ) {
            self.state = match &self.snapshot {
                Some(snapshot) if snapshot.is_modified() => PersistenceState::Modified,
                Some(_) => PersistenceState::Synchronized,
                None => PersistenceState::Removed,
            };
        }
    }

    pub(crate) fn remap(&self, remap: &impl Fn(&Key) -> Key) -> Self {
        Self {
            key: remap(&self.key.remap_refs(remap)),
            snapshot: self.snapshot.as_ref().map(|snapshot| snapshot.remap_refs(remap)),
            state: self.state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Key {
        Key::new("Customer", vec![Value::Integer(1)])
    }

    #[test]
    fn test_write_marks_modified_and_back() {
        let mut record = EntityRecord::synchronized(key(), vec![Value::from("Ann")]);
        record.write(0, Value::from("Bob")).unwrap();
        assert_eq!(record.state(), PersistenceState::Modified);

        record.write(0, Value::from("Ann")).unwrap();
        assert_eq!(record.state(), PersistenceState::Synchronized);
    }

    #[test]
    fn test_new_stays_new_on_write() {
        let mut record = EntityRecord::created(key(), vec![Value::from("Ann")]);
        record.write(0, Value::from("Bob")).unwrap();
        assert_eq!(record.state(), PersistenceState::New);
        assert_eq!(record.values(), Some(vec![Value::from("Bob")]));
    }

    #[test]
    fn test_write_to_removed_is_inconsistent_state() {
        let mut record = EntityRecord::tombstone(key());
        let err = record.write(0, Value::from("x")).unwrap_err();
        assert!(matches!(err, DbError::InconsistentState(_)));
        assert!(record.values().is_none());
    }
}
