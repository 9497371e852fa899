// ============================================================================
// In-Memory Live Source
// ============================================================================
//
// Reference implementation of the live-session contract. Any number of
// sessions share one `MemorySource`. Writes are applied immediately and
// recorded in the session's transaction so rollback can reverse them.
//
// Integer fields flagged as version fields are maintained by the source:
// 1 on insert, previous + 1 on every update.
//
// ============================================================================

use super::LiveSession;
use crate::core::{DataType, DbError, EntityModel, Key, Result, Tuple, Value};
use crate::transaction::{Change, Transaction, TransactionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Level, event};

#[derive(Debug, Default)]
struct SourceData {
    entities: HashMap<Key, Tuple>,
    /// Next id handed out by `generate_key`, per entity type.
    next_ids: HashMap<String, i64>,
}

impl SourceData {
    fn reserve_id(&mut self, key: &Key) {
        if let [Value::Integer(id)] = key.values() {
            let next = self.next_ids.entry(key.entity_type().to_string()).or_insert(1);
            *next = (*next).max(id + 1);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<RwLock<SourceData>>,
    model: Arc<EntityModel>,
}

impl MemorySource {
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self {
            data: Arc::new(RwLock::new(SourceData::default())),
            model,
        }
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn session(&self) -> MemorySession {
        self.named_session("memory")
    }

    pub fn named_session(&self, name: impl Into<String>) -> MemorySession {
        MemorySession {
            name: name.into(),
            source: self.clone(),
            transaction: None,
        }
    }

    pub async fn get(&self, key: &Key) -> Option<Tuple> {
        self.data.read().await.entities.get(key).cloned()
    }

    /// Stores `values` as-is, bypassing sessions and version maintenance.
    pub async fn put(&self, key: Key, values: Tuple) {
        let mut data = self.data.write().await;
        data.reserve_id(&key);
        data.entities.insert(key, values);
    }

    pub async fn delete(&self, key: &Key) -> Option<Tuple> {
        self.data.write().await.entities.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.entities.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<Key> {
        self.data.read().await.entities.keys().cloned().collect()
    }
}

pub struct MemorySession {
    name: String,
    source: MemorySource,
    transaction: Option<Transaction>,
}

impl MemorySession {
    pub fn source(&self) -> &MemorySource {
        &self.source
    }

    fn record(&mut self, change: Change) -> Result<()> {
        match self.transaction.as_mut() {
            Some(transaction) => transaction.record_change(change),
            None => Ok(()),
        }
    }

    fn ensure_transaction(&mut self) -> Result<&mut Transaction> {
        self.transaction
            .as_mut()
            .ok_or_else(|| DbError::Session(format!("session '{}' has no open transaction", self.name)))
    }

    /// Sets every integer version field of `values` to `next(previous)`.
    fn stamp_versions(&self, key: &Key, values: &mut Tuple, previous: Option<&Tuple>) -> Result<()> {
        let type_info = self.source.model.type_of(key)?;
        for offset in type_info.version_fields() {
            let is_integer = type_info
                .field(offset)
                .is_some_and(|field| field.data_type == DataType::Integer);
            if !is_integer {
                continue;
            }
            let next = match previous.and_then(|tuple| tuple.get(offset)) {
                Some(Value::Integer(version)) => version + 1,
                _ => 1,
            };
            if values.len() <= offset {
                values.resize(offset + 1, Value::Null);
            }
            values[offset] = Value::Integer(next);
        }
        Ok(())
    }
}

#[async_trait]
impl LiveSession for MemorySession {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> Arc<EntityModel> {
        self.source.model.clone()
    }

    async fn fetch_by_key(&mut self, key: &Key) -> Result<Option<Tuple>> {
        Ok(self.source.get(key).await)
    }

    async fn fetch_many(&mut self, keys: &[Key]) -> Result<Vec<(Key, Option<Tuple>)>> {
        let data = self.source.data.read().await;
        Ok(keys
            .iter()
            .map(|key| (key.clone(), data.entities.get(key).cloned()))
            .collect())
    }

    async fn generate_key(&mut self, entity_type: &str) -> Result<Key> {
        self.source.model.get(entity_type)?;
        let mut data = self.source.data.write().await;
        let next = data.next_ids.entry(entity_type.to_string()).or_insert(1);
        let id = *next;
        *next += 1;
        Ok(Key::new(entity_type, vec![Value::Integer(id)]))
    }

    async fn insert(&mut self, key: &Key, mut values: Tuple) -> Result<()> {
        if key.is_temporary() {
            return Err(DbError::Session(format!("cannot store temporary key {}", key)));
        }
        self.stamp_versions(key, &mut values, None)?;
        {
            let mut data = self.source.data.write().await;
            if data.entities.contains_key(key) {
                return Err(DbError::Session(format!("duplicate key {}", key)));
            }
            data.reserve_id(key);
            data.entities.insert(key.clone(), values);
        }
        self.record(Change::Insert { key: key.clone() })
    }

    async fn update(&mut self, key: &Key, mut values: Tuple) -> Result<()> {
        let old = {
            let data = self.source.data.read().await;
            data.entities
                .get(key)
                .cloned()
                .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?
        };
        self.stamp_versions(key, &mut values, Some(&old))?;
        self.source.data.write().await.entities.insert(key.clone(), values);
        self.record(Change::Update { key: key.clone(), old })
    }

    async fn remove(&mut self, key: &Key) -> Result<()> {
        let old = self
            .source
            .data
            .write()
            .await
            .entities
            .remove(key)
            .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;
        self.record(Change::Delete { key: key.clone(), old })
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(DbError::Session(format!(
                "session '{}' already has an open transaction",
                self.name
            )));
        }
        let transaction = Transaction::new(TransactionId::new());
        event!(Level::DEBUG, session = %self.name, txn = %transaction.id(), "live transaction started");
        self.transaction = Some(transaction);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let transaction = self.ensure_transaction()?;
        transaction.commit()?;
        event!(Level::DEBUG, txn = %transaction.id(), "live transaction committed");
        self.transaction = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        let transaction = self.ensure_transaction()?;
        let undo = transaction.rollback()?;
        let id = transaction.id();
        self.transaction = None;

        let mut data = self.source.data.write().await;
        for change in &undo {
            match change.restore_value() {
                Some(old) => {
                    data.entities.insert(change.key().clone(), old.clone());
                }
                None => {
                    data.entities.remove(change.key());
                }
            }
        }
        event!(Level::DEBUG, txn = %id, undone = undo.len(), "live transaction rolled back");
        Ok(())
    }

    fn has_open_transaction(&self) -> bool {
        self.transaction.is_some()
    }
}
