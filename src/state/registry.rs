// ============================================================================
// State Registry
// ============================================================================
//
// A layer of entity records that falls back to an origin layer for anything
// it does not hold itself. Layers form a chain owned child-to-parent:
//
//   transactional ──> local ──> original
//
// Reads never write through. `commit` folds a layer into its origin.
// Records live in persistent maps, so cloning a whole chain is cheap.
//
// ============================================================================

use super::{EntityRecord, MergeBehavior, PersistenceState};
use crate::core::{DbError, Key, Result, Tuple, Value};
use crate::operations::{KeyMapping, Operation, OperationLog};
use std::collections::HashSet;

#[derive(Debug, Clone, Default)]
pub struct StateRegistry {
    records: im::HashMap<Key, EntityRecord>,
    origin: Option<Box<StateRegistry>>,
    operations: OperationLog,
}

impl StateRegistry {
    /// A root registry with no origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new empty layer on top of `origin`.
    pub fn layered(origin: StateRegistry) -> Self {
        Self {
            records: im::HashMap::new(),
            origin: Some(Box::new(origin)),
            operations: OperationLog::new(),
        }
    }

    /// Rebuilds a root layer from serialized records.
    pub fn from_records(records: impl IntoIterator<Item = EntityRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.key().clone(), record))
                .collect(),
            origin: None,
            operations: OperationLog::new(),
        }
    }

    /// Rebuilds a layer on `origin` from serialized records and operations.
    pub fn restore_layer(
        origin: StateRegistry,
        records: impl IntoIterator<Item = EntityRecord>,
        operations: OperationLog,
    ) -> Self {
        let mut layer = Self::layered(origin);
        layer.records = records
            .into_iter()
            .map(|record| (record.key().clone(), record))
            .collect();
        layer.operations = operations;
        layer
    }

    pub fn origin(&self) -> Option<&StateRegistry> {
        self.origin.as_deref()
    }

    /// Drops this layer and hands back its origin.
    pub fn into_origin(self) -> Option<StateRegistry> {
        self.origin.map(|origin| *origin)
    }

    pub fn root(&self) -> &StateRegistry {
        match &self.origin {
            Some(origin) => origin.root(),
            None => self,
        }
    }

    pub fn operations(&self) -> &OperationLog {
        &self.operations
    }

    /// Captures `operation` in this layer. Unique operations are checked
    /// against every layer below as well.
    pub fn log(&mut self, operation: Operation) -> Result<bool> {
        let mut layer = self.origin();
        while let Some(current) = layer {
            if !current.operations.admits(&operation)? {
                return Ok(false);
            }
            layer = current.origin();
        }
        self.operations.log(operation)
    }

    /// Records held by this layer only.
    pub fn local_records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.records.values()
    }

    pub fn get_local(&self, key: &Key) -> Option<&EntityRecord> {
        self.records.get(key)
    }

    /// The nearest record for `key` in the chain.
    pub fn get(&self, key: &Key) -> Option<&EntityRecord> {
        self.records
            .get(key)
            .or_else(|| self.origin.as_ref().and_then(|origin| origin.get(key)))
    }

    /// Current values of `key`; `None` when absent or removed.
    pub fn values(&self, key: &Key) -> Option<Tuple> {
        self.get(key).and_then(|record| record.values())
    }

    pub fn read(&self, key: &Key, offset: usize) -> Option<&Value> {
        self.get(key).and_then(|record| record.read(offset))
    }

    fn alive_upstream(&self, key: &Key) -> bool {
        self.origin
            .as_ref()
            .and_then(|origin| origin.get(key))
            .is_some_and(|record| !record.is_removed())
    }

    /// Lifecycle of `key` relative to the root of the chain.
    pub fn persistence_state(&self, key: &Key) -> Option<PersistenceState> {
        let top = self.get(key)?;
        if top.is_removed() {
            return Some(PersistenceState::Removed);
        }
        if top.state() == PersistenceState::Inconsistent {
            return Some(PersistenceState::Inconsistent);
        }

        let mut modified = false;
        let mut layer = Some(self);
        while let Some(current) = layer {
            if let Some(record) = current.records.get(key) {
                match record.state() {
                    PersistenceState::New => return Some(PersistenceState::New),
                    PersistenceState::Modified | PersistenceState::Inconsistent => modified = true,
                    // Re-created over a tombstone: whatever lies below is gone.
                    PersistenceState::Removed => break,
                    PersistenceState::Synchronized => {}
                }
            }
            layer = current.origin();
        }

        Some(if modified {
            PersistenceState::Modified
        } else {
            PersistenceState::Synchronized
        })
    }

    /// Keys visible from this layer; the nearest record decides removal.
    pub fn all_keys(&self, include_removed: bool) -> Vec<Key> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        let mut layer = Some(self);
        while let Some(current) = layer {
            for (key, record) in current.records.iter() {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if record.is_removed() && !include_removed {
                    continue;
                }
                keys.push(key.clone());
            }
            layer = current.origin();
        }
        keys
    }

    /// Puts `key` into this layer. Origin data is stored as a clean,
    /// synchronized record; local data is New unless the key is already
    /// alive upstream, in which case it becomes a modification of it.
    /// Re-creating a key overwrites the previous local record.
    pub fn create(&mut self, key: Key, values: Tuple, is_origin: bool) {
        let record = if is_origin {
            EntityRecord::synchronized(key.clone(), values)
        } else if let Some(upstream) = self
            .origin
            .as_ref()
            .and_then(|origin| origin.values(&key))
        {
            let mut record = EntityRecord::derived(key.clone(), upstream);
            if let Some(snapshot) = record.snapshot_mut() {
                for (offset, value) in values.iter().enumerate() {
                    snapshot.write(offset, value.clone());
                }
            }
            record.refresh_state();
            record
        } else {
            EntityRecord::created(key.clone(), values)
        };
        self.records.insert(key, record);
    }

    /// The local record for `key`, copied from upstream on first touch.
    fn ensure_local(&mut self, key: &Key) -> Result<&mut EntityRecord> {
        if !self.records.contains_key(key) {
            let upstream = self
                .origin
                .as_ref()
                .and_then(|origin| origin.values(key))
                .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;
            self.records
                .insert(key.clone(), EntityRecord::derived(key.clone(), upstream));
        }
        self.records
            .get_mut(key)
            .ok_or_else(|| DbError::EntityNotFound(key.to_string()))
    }

    pub fn write(&mut self, key: &Key, offset: usize, value: Value) -> Result<()> {
        self.ensure_local(key)?.write(offset, value)
    }

    /// Marks `key` removed. A key nobody upstream has seen is purged instead
    /// of tombstoned.
    pub fn remove(&mut self, key: &Key) -> Result<()> {
        match self.get(key) {
            Some(record) if !record.is_removed() => {}
            _ => return Err(DbError::EntityNotFound(key.to_string())),
        }
        if self.alive_upstream(key) {
            self.records
                .insert(key.clone(), EntityRecord::tombstone(key.clone()));
        } else {
            self.records.remove(key);
        }
        Ok(())
    }

    /// Folds fresh source data for `key` into the root of the chain, then
    /// rebases every layer's local copy on the view of the layer below.
    /// Local overlays survive.
    pub fn update_origin(&mut self, key: &Key, fresh: &Tuple, behavior: MergeBehavior) {
        match self.origin.as_deref_mut() {
            Some(origin) => {
                origin.update_origin(key, fresh, behavior);
                let view = origin.values(key);
                if let (Some(view), Some(record)) = (view, self.records.get_mut(key)) {
                    if let Some(snapshot) = record.snapshot_mut() {
                        snapshot.replace_origin(view);
                        record.refresh_state();
                    }
                }
            }
            None => match self.records.get_mut(key) {
                Some(record) if !record.is_removed() => {
                    if let Some(snapshot) = record.snapshot_mut() {
                        snapshot.merge_with(fresh, behavior);
                    }
                    record.set_state(PersistenceState::Synchronized);
                }
                _ => {
                    self.records.insert(
                        key.clone(),
                        EntityRecord::synchronized(key.clone(), fresh.clone()),
                    );
                }
            },
        }
    }

    /// The source no longer has `key`: the baseline forgets it, local edits
    /// on top of it become inconsistent and local tombstones are moot.
    pub fn remove_origin(&mut self, key: &Key) {
        match self.origin.as_deref_mut() {
            Some(origin) => {
                origin.remove_origin(key);
                let purge = match self.records.get_mut(key) {
                    Some(record) if record.is_removed() => true,
                    Some(record) => {
                        if record.state() != PersistenceState::New {
                            record.set_state(PersistenceState::Inconsistent);
                        }
                        false
                    }
                    None => false,
                };
                if purge {
                    self.records.remove(key);
                }
            }
            None => {
                self.records.remove(key);
            }
        }
    }

    /// Folds every local record into the origin layer and empties this one.
    ///
    /// With `to_origin` the records become the origin's clean baseline and
    /// the captured operations are dropped (they have been applied). Without
    /// it, lifecycle states and operations carry over unchanged.
    pub fn commit(&mut self, to_origin: bool) -> Result<()> {
        let origin = self.origin.as_deref_mut().ok_or_else(|| {
            DbError::InconsistentState("cannot commit a registry without an origin".into())
        })?;

        if !to_origin {
            origin.operations.append(&self.operations)?;
        }

        let records = std::mem::take(&mut self.records);
        for (key, record) in records {
            if to_origin {
                origin.absorb_as_origin(key, record);
            } else {
                origin.absorb(key, record);
            }
        }
        self.operations.clear();
        Ok(())
    }

    fn absorb(&mut self, key: Key, record: EntityRecord) {
        let Some(snapshot) = record.snapshot() else {
            if self.alive_upstream(&key) {
                self.records.insert(key.clone(), EntityRecord::tombstone(key));
            } else {
                self.records.remove(&key);
            }
            return;
        };

        match self.records.get_mut(&key) {
            Some(existing) if !existing.is_removed() => {
                if let Some(target) = existing.snapshot_mut() {
                    for (offset, value) in snapshot.overlay() {
                        target.write(offset, value.clone());
                    }
                }
                if record.state() == PersistenceState::Inconsistent {
                    existing.set_state(PersistenceState::Inconsistent);
                }
                existing.refresh_state();
            }
            _ => {
                self.records.insert(key, record);
            }
        }
    }

    fn absorb_as_origin(&mut self, key: Key, record: EntityRecord) {
        match record.values() {
            Some(values) => {
                self.records
                    .insert(key.clone(), EntityRecord::synchronized(key, values));
            }
            None => {
                if self.alive_upstream(&key) {
                    self.records.insert(key.clone(), EntityRecord::tombstone(key));
                } else {
                    self.records.remove(&key);
                }
            }
        }
    }

    /// Rewrites keys and entity references of this layer through `mapping`.
    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        let remap = |key: &Key| mapping.try_remap_key(key).clone();
        self.records = self
            .records
            .values()
            .map(|record| {
                let remapped = record.remap(&remap);
                (remapped.key().clone(), remapped)
            })
            .collect();
    }
}
