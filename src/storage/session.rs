// ============================================================================
// Live Session Contract
// ============================================================================
//
// The collaborator a disconnected state replays against. A session wraps one
// connection to the live source and owns at most one open transaction.
//
// ============================================================================

use crate::core::{EntityModel, Key, Result, Tuple, VersionInfo};
use crate::operations::KeyMapping;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait LiveSession: Send {
    /// Name used in logs and spans.
    fn name(&self) -> &str;

    /// Entity types this session understands.
    fn model(&self) -> Arc<EntityModel>;

    async fn fetch_by_key(&mut self, key: &Key) -> Result<Option<Tuple>>;

    /// Bulk fetch. Sessions able to batch reads should override this.
    async fn fetch_many(&mut self, keys: &[Key]) -> Result<Vec<(Key, Option<Tuple>)>> {
        let mut fetched = Vec::with_capacity(keys.len());
        for key in keys {
            let tuple = self.fetch_by_key(key).await?;
            fetched.push((key.clone(), tuple));
        }
        Ok(fetched)
    }

    /// Allocates a fresh persistent key for an entity of `entity_type`.
    async fn generate_key(&mut self, entity_type: &str) -> Result<Key>;

    async fn insert(&mut self, key: &Key, values: Tuple) -> Result<()>;

    async fn update(&mut self, key: &Key, values: Tuple) -> Result<()>;

    async fn remove(&mut self, key: &Key) -> Result<()>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    fn has_open_transaction(&self) -> bool;

    /// Flushes writes buffered by the session into the source and ends its
    /// open transaction, so the session can start a new one.
    async fn persist_pending_writes(&mut self) -> Result<()> {
        if self.has_open_transaction() {
            self.commit().await?;
        }
        Ok(())
    }

    /// Drops whatever the session cached about the source.
    fn invalidate(&mut self) {}

    /// Rewrites entity references held by the session after a replay
    /// assigned persistent keys.
    fn remap_references(&mut self, _mapping: &KeyMapping) {}
}

/// Reads the current version of entities after changes were applied.
#[async_trait]
pub trait VersionProvider: Send + Sync {
    async fn versions(
        &self,
        session: &mut dyn LiveSession,
        model: &EntityModel,
        keys: &[Key],
    ) -> Result<Vec<(Key, VersionInfo)>>;
}

/// Reads entities back from the session and extracts their versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionVersionProvider;

#[async_trait]
impl VersionProvider for SessionVersionProvider {
    async fn versions(
        &self,
        session: &mut dyn LiveSession,
        model: &EntityModel,
        keys: &[Key],
    ) -> Result<Vec<(Key, VersionInfo)>> {
        let mut versions = Vec::new();
        for (key, tuple) in session.fetch_many(keys).await? {
            if let Some(tuple) = tuple {
                let version = model.extract_version(&key, &tuple)?;
                versions.push((key, version));
            }
        }
        Ok(versions)
    }
}
