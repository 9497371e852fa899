use crate::core::{Key, VersionInfo};
use crate::operations::KeyMapping;
use serde::{Deserialize, Serialize};

static VOID: VersionInfo = VersionInfo::void();

/// Last known version of every entity a disconnected state has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionSet {
    versions: im::HashMap<Key, VersionInfo>,
}

impl VersionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `version` for `key`. Without `overwrite` an existing entry is
    /// kept. Void versions are never stored. Returns whether the set changed.
    pub fn add(&mut self, key: Key, version: VersionInfo, overwrite: bool) -> bool {
        if version.is_void() {
            return false;
        }
        if !overwrite && self.versions.contains_key(&key) {
            return false;
        }
        let previous = self.versions.insert(key, version.clone());
        previous.as_ref() != Some(&version)
    }

    /// Known version of `key`, void when unknown.
    pub fn get(&self, key: &Key) -> &VersionInfo {
        self.versions.get(key).unwrap_or(&VOID)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.versions.contains_key(key)
    }

    pub fn remove(&mut self, key: &Key) -> Option<VersionInfo> {
        self.versions.remove(key)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Key) -> bool) {
        self.versions.retain(|key, _| keep(key));
    }

    pub fn remap_keys(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        self.versions = self
            .versions
            .iter()
            .map(|(key, version)| (mapping.remap_key(key), version.clone()))
            .collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &VersionInfo)> {
        self.versions.iter()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl std::ops::Index<&Key> for VersionSet {
    type Output = VersionInfo;

    fn index(&self, key: &Key) -> &VersionInfo {
        self.get(key)
    }
}

impl FromIterator<(Key, VersionInfo)> for VersionSet {
    fn from_iter<I: IntoIterator<Item = (Key, VersionInfo)>>(iter: I) -> Self {
        let mut set = VersionSet::new();
        for (key, version) in iter {
            set.add(key, version, true);
        }
        set
    }
}

impl Serialize for VersionSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.versions.iter())
    }
}

impl<'de> Deserialize<'de> for VersionSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(Key, VersionInfo)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use std::collections::HashMap;

    fn key(id: i64) -> Key {
        Key::new("Customer", vec![Value::Integer(id)])
    }

    fn v(n: i64) -> VersionInfo {
        VersionInfo::new(vec![Value::Integer(n)])
    }

    #[test]
    fn test_unknown_key_reads_void() {
        let set = VersionSet::new();
        assert!(set[&key(1)].is_void());
    }

    #[test]
    fn test_add_respects_overwrite_flag() {
        let mut set = VersionSet::new();
        assert!(set.add(key(1), v(1), false));
        assert!(!set.add(key(1), v(2), false));
        assert_eq!(set[&key(1)], v(1));

        assert!(set.add(key(1), v(2), true));
        assert_eq!(set[&key(1)], v(2));
    }

    #[test]
    fn test_void_versions_are_not_stored() {
        let mut set = VersionSet::new();
        assert!(!set.add(key(1), VersionInfo::void(), true));
        assert!(!set.contains(&key(1)));
    }

    #[test]
    fn test_remap_keys() {
        let temp = Key::temporary("Customer");
        let mut set = VersionSet::new();
        set.add(temp.clone(), v(1), true);

        let mut map = HashMap::new();
        map.insert(temp.clone(), key(7));
        set.remap_keys(&KeyMapping::new(map));

        assert!(!set.contains(&temp));
        assert_eq!(set[&key(7)], v(1));
    }
}
