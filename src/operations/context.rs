use super::KeyMapping;
use crate::core::{Key, Result, Tuple};
use crate::storage::LiveSession;
use std::collections::{HashMap, HashSet};

/// Notified about every entity read from the live source during replay,
/// before any operation mutates it.
pub trait ReplayObserver: Send {
    fn entity_fetched(&mut self, key: &Key, tuple: Option<&Tuple>) -> Result<()>;
}

/// Execution state shared by all operations of one replay.
pub struct OperationContext<'a> {
    session: &'a mut dyn LiveSession,
    observer: Option<&'a mut dyn ReplayObserver>,
    mapping: KeyMapping,
    prefetch: Vec<Key>,
    prefetch_set: HashSet<Key>,
    cache: HashMap<Key, Option<Tuple>>,
    observed: HashSet<Key>,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        session: &'a mut dyn LiveSession,
        observer: Option<&'a mut dyn ReplayObserver>,
    ) -> Self {
        Self {
            session,
            observer,
            mapping: KeyMapping::default(),
            prefetch: Vec::new(),
            prefetch_set: HashSet::new(),
            cache: HashMap::new(),
            observed: HashSet::new(),
        }
    }

    pub fn key_mapping(&self) -> &KeyMapping {
        &self.mapping
    }

    pub fn into_key_mapping(self) -> KeyMapping {
        self.mapping
    }

    /// Asks the source for a persistent key standing in for `temporary`.
    pub async fn allocate_key(&mut self, temporary: &Key) -> Result<Key> {
        if let Some(existing) = self.mapping.get(temporary) {
            return Ok(existing.clone());
        }
        let allocated = self.session.generate_key(temporary.entity_type()).await?;
        self.mapping.insert(temporary.clone(), allocated.clone());
        Ok(allocated)
    }

    /// Resolves temporary keys and references inside key values.
    pub fn resolve_key(&self, key: &Key) -> Key {
        self.mapping.remap_key(key)
    }

    /// Queues a persistent key for the bulk fetch that precedes execution.
    pub fn register_prefetch(&mut self, key: &Key) {
        let key = self.resolve_key(key);
        if key.is_temporary() {
            return;
        }
        if self.prefetch_set.insert(key.clone()) {
            self.prefetch.push(key);
        }
    }

    pub async fn prefetch(&mut self) -> Result<()> {
        if self.prefetch.is_empty() {
            return Ok(());
        }
        let keys = std::mem::take(&mut self.prefetch);
        let fetched = self.session.fetch_many(&keys).await?;
        for (key, tuple) in fetched {
            self.cache.entry(key).or_insert(tuple);
        }
        Ok(())
    }

    /// Current live value of `key`, as seen by this replay. The observer sees
    /// each entity once, in its pre-replay state.
    pub async fn fetch(&mut self, key: &Key) -> Result<Option<Tuple>> {
        let tuple = match self.cache.get(key) {
            Some(cached) => cached.clone(),
            None => {
                let fetched = self.session.fetch_by_key(key).await?;
                self.cache.insert(key.clone(), fetched.clone());
                fetched
            }
        };
        if self.observed.insert(key.clone()) {
            if let Some(observer) = self.observer.as_mut() {
                observer.entity_fetched(key, tuple.as_ref())?;
            }
        }
        Ok(tuple)
    }

    pub async fn insert(&mut self, key: &Key, values: Tuple) -> Result<()> {
        self.session.insert(key, values.clone()).await?;
        // Created by this replay; nothing to validate against.
        self.observed.insert(key.clone());
        self.cache.insert(key.clone(), Some(values));
        Ok(())
    }

    pub async fn update(&mut self, key: &Key, values: Tuple) -> Result<()> {
        self.session.update(key, values.clone()).await?;
        self.cache.insert(key.clone(), Some(values));
        Ok(())
    }

    pub async fn remove(&mut self, key: &Key) -> Result<()> {
        self.session.remove(key).await?;
        self.cache.insert(key.clone(), None);
        Ok(())
    }
}
