use crate::core::{Key, Tuple, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a replay: temporary keys mapped to the keys the source assigned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMapping {
    map: HashMap<Key, Key>,
}

impl KeyMapping {
    pub fn new(map: HashMap<Key, Key>) -> Self {
        Self { map }
    }

    /// The mapped key, or `key` itself when it was never remapped.
    pub fn try_remap_key<'a>(&'a self, key: &'a Key) -> &'a Key {
        self.map.get(key).unwrap_or(key)
    }

    /// Remaps `key` and every entity reference inside its values.
    pub fn remap_key(&self, key: &Key) -> Key {
        let remap = |k: &Key| self.try_remap_key(k).clone();
        remap(&key.remap_refs(&remap))
    }

    pub fn remap_value(&self, value: &Value) -> Value {
        value.remap_refs(&|k: &Key| self.try_remap_key(k).clone())
    }

    pub fn remap_tuple(&self, tuple: &Tuple) -> Tuple {
        tuple.iter().map(|value| self.remap_value(value)).collect()
    }

    pub(crate) fn insert(&mut self, temporary: Key, persistent: Key) {
        self.map.insert(temporary, persistent);
    }

    pub fn get(&self, key: &Key) -> Option<&Key> {
        self.map.get(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Key)> {
        self.map.iter()
    }
}

/// Flat pair list: keys are structured and cannot be JSON map keys.
impl Serialize for KeyMapping {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.map.iter())
    }
}

impl<'de> Deserialize<'de> for KeyMapping {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(Key, Key)>::deserialize(deserializer)?;
        Ok(Self {
            map: pairs.into_iter().collect(),
        })
    }
}
