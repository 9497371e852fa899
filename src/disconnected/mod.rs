// ============================================================================
// Disconnected State
// ============================================================================
//
// Coordinator of an offline entity cache. Owns three registry layers:
//
//   original       baseline last read from (or applied to) the live source
//   state          local changes committed locally but not yet applied
//   transactional  open local transaction, only while one exists
//
// Local edits are captured as operations in the layer they were made in and
// replayed against a live session by `apply_changes`.
//
// ============================================================================

pub mod config;
pub mod events;
pub mod scope;

pub use config::OfflineConfig;
pub use events::LifecycleEvent;
pub use scope::{AttachScope, ConnectScope};

use crate::core::{
    DbError, EntityModel, EntityValidator, Key, Result, SchemaValidator, Tuple, Value,
    VersionInfo,
};
use crate::operations::{KeyMapping, Operation, OperationLog, ReplayObserver};
use crate::state::{PersistenceState, StateRegistry};
use crate::storage::{
    DisconnectedSnapshot, LiveSession, SessionVersionProvider, SnapshotManager, VersionProvider,
};
use crate::version::{MergeMode, VersionSet, VersionValidator};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy)]
struct LocalTransaction {
    /// Opened by `connect` and committed by `disconnect`.
    chained: bool,
}

pub struct DisconnectedState {
    model: Arc<EntityModel>,
    config: OfflineConfig,
    /// Top layer: `state` over `original`, plus a transactional layer while
    /// a local transaction is open.
    registry: StateRegistry,
    transaction: Option<LocalTransaction>,
    versions: VersionSet,
    session: Option<Box<dyn LiveSession>>,
    connected: bool,
    validator: Arc<dyn EntityValidator>,
    version_provider: Arc<dyn VersionProvider>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl DisconnectedState {
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self::build(model, OfflineConfig::default(), StateRegistry::layered(StateRegistry::new()))
    }

    pub fn with_config(model: Arc<EntityModel>, config: OfflineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(
            model,
            config,
            StateRegistry::layered(StateRegistry::new()),
        ))
    }

    fn build(model: Arc<EntityModel>, config: OfflineConfig, registry: StateRegistry) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            model,
            config,
            registry,
            transaction: None,
            versions: VersionSet::new(),
            session: None,
            connected: false,
            validator: Arc::new(SchemaValidator),
            version_provider: Arc::new(SessionVersionProvider),
            events,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn EntityValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_version_provider(mut self, provider: Arc<dyn VersionProvider>) -> Self {
        self.version_provider = provider;
        self
    }

    pub fn model(&self) -> &Arc<EntityModel> {
        &self.model
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn versions(&self) -> &VersionSet {
        &self.versions
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Baseline layer.
    pub fn original(&self) -> &StateRegistry {
        self.registry.root()
    }

    /// Locally committed layer, below any open local transaction.
    pub fn local(&self) -> &StateRegistry {
        match self.transaction {
            Some(_) => self.registry.origin().unwrap_or(&self.registry),
            None => &self.registry,
        }
    }

    /// Operations committed locally and waiting to be applied.
    pub fn operations(&self) -> &OperationLog {
        self.local().operations()
    }

    fn ensure_no_transaction(&self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(DbError::TransactionOpen);
        }
        Ok(())
    }

    fn pop_layer(&mut self) -> Result<StateRegistry> {
        std::mem::take(&mut self.registry)
            .into_origin()
            .ok_or_else(|| DbError::InconsistentState("registry layer has no origin".into()))
    }

    // ------------------------------------------------------------------
    // Attach / connect
    // ------------------------------------------------------------------

    /// Attaches a live session. An outer transaction open on the session is
    /// flushed and the session's caches invalidated first.
    pub async fn attach(&mut self, mut session: Box<dyn LiveSession>) -> Result<()> {
        if self.session.is_some() {
            return Err(DbError::AlreadyAttached);
        }
        if session.has_open_transaction() {
            event!(Level::DEBUG, session = %session.name(), "flushing outer transaction before attach");
            session.persist_pending_writes().await?;
            session.invalidate();
            if session.has_open_transaction() {
                return Err(DbError::Session(format!(
                    "session '{}' kept its outer transaction open after flush",
                    session.name()
                )));
            }
        }
        event!(Level::DEBUG, session = %session.name(), "session attached");
        self.session = Some(session);
        Ok(())
    }

    pub async fn attach_scope(&mut self, session: Box<dyn LiveSession>) -> Result<AttachScope<'_>> {
        self.attach(session).await?;
        Ok(AttachScope::new(self))
    }

    pub fn detach(&mut self) -> Result<Box<dyn LiveSession>> {
        self.ensure_no_transaction()?;
        let session = self.session.take().ok_or(DbError::NotAttached)?;
        self.connected = false;
        event!(Level::DEBUG, session = %session.name(), "session detached");
        Ok(session)
    }

    /// Lets reads fall through to the attached session. Opens a chained
    /// local transaction when configured and none is open.
    pub fn connect(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Err(DbError::NotAttached);
        }
        if self.connected {
            return Err(DbError::InconsistentState("already connected".into()));
        }
        self.connected = true;
        if self.config.chain_connected_transactions && self.transaction.is_none() {
            self.open_transaction(true);
        }
        event!(Level::DEBUG, "connected");
        Ok(())
    }

    pub fn connect_scope(&mut self) -> Result<ConnectScope<'_>> {
        self.connect()?;
        Ok(ConnectScope::new(self))
    }

    /// Stops live reads and commits the chained local transaction.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(DbError::InconsistentState("not connected".into()));
        }
        self.connected = false;
        event!(Level::DEBUG, "disconnected");
        if self.transaction.is_some_and(|tx| tx.chained) {
            self.commit_transaction()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.ensure_no_transaction()?;
        self.open_transaction(false);
        Ok(())
    }

    fn open_transaction(&mut self, chained: bool) {
        let state = std::mem::take(&mut self.registry);
        self.registry = StateRegistry::layered(state);
        self.transaction = Some(LocalTransaction { chained });
        event!(Level::DEBUG, chained, "local transaction opened");
        self.publish(LifecycleEvent::TransactionOpened);
    }

    /// Folds the transactional layer into the local one. On failure the
    /// transaction stays open.
    pub fn commit_transaction(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            return Err(DbError::NoTransaction);
        }
        let operations = self.registry.operations().len();
        self.registry.commit(false)?;
        self.registry = self.pop_layer()?;
        self.transaction = None;
        event!(Level::DEBUG, operations, "local transaction committed");
        self.publish(LifecycleEvent::TransactionCommitted { operations });
        Ok(())
    }

    pub fn rollback_transaction(&mut self) -> Result<()> {
        if self.transaction.is_none() {
            return Err(DbError::NoTransaction);
        }
        self.registry = self.pop_layer()?;
        self.transaction = None;
        event!(Level::DEBUG, "local transaction rolled back");
        self.publish(LifecycleEvent::TransactionRolledBack);
        Ok(())
    }

    /// Runs `edit` inside the open local transaction, or inside an implicit
    /// one committed on success. A failed edit leaves no trace.
    fn edit<T>(&mut self, edit: impl FnOnce(&mut StateRegistry) -> Result<T>) -> Result<T> {
        if self.transaction.is_some() {
            let backup = self.registry.clone();
            let outcome = edit(&mut self.registry);
            if outcome.is_err() {
                self.registry = backup;
            }
            return outcome;
        }

        let state = std::mem::take(&mut self.registry);
        let mut implicit = StateRegistry::layered(state);
        let outcome = edit(&mut implicit).and_then(|value| implicit.commit(false).map(|()| value));
        self.registry = implicit
            .into_origin()
            .ok_or_else(|| DbError::InconsistentState("registry layer has no origin".into()))?;
        outcome
    }

    // ------------------------------------------------------------------
    // Local editing
    // ------------------------------------------------------------------

    /// Creates an entity under a fresh temporary key.
    pub fn create_entity(&mut self, entity_type: &str, values: Tuple) -> Result<Key> {
        let key = Key::temporary(entity_type);
        self.create_entity_with_key(key.clone(), values)?;
        Ok(key)
    }

    pub fn create_entity_with_key(&mut self, key: Key, values: Tuple) -> Result<()> {
        let type_info = self.model.type_of(&key)?;
        self.validator.validate(type_info, &key, &values)?;
        if self.registry.values(&key).is_some() {
            return Err(DbError::InconsistentState(format!("entity {} already exists", key)));
        }

        self.edit(|registry| {
            registry.create(key.clone(), values.clone(), false);
            registry.log(Operation::insert(key.clone(), values))?;
            Ok(())
        })?;
        self.publish(LifecycleEvent::Created { key });
        Ok(())
    }

    /// Writes `changes` (field offset, value) into `key`.
    pub fn update_entity(&mut self, key: &Key, changes: Vec<(usize, Value)>) -> Result<()> {
        let current = self
            .registry
            .values(key)
            .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;

        let mut next = current.clone();
        for (offset, value) in &changes {
            if *offset >= next.len() {
                next.resize(offset + 1, Value::Null);
            }
            next[*offset] = value.clone();
        }
        let type_info = self.model.type_of(key)?;
        self.validator.validate(type_info, key, &next)?;

        let previous = changes
            .iter()
            .map(|(offset, _)| (*offset, current.get(*offset).cloned().unwrap_or(Value::Null)))
            .collect();
        let offsets: Vec<usize> = changes.iter().map(|(offset, _)| *offset).collect();

        self.edit(|registry| {
            for (offset, value) in &changes {
                registry.write(key, *offset, value.clone())?;
            }
            registry.log(Operation::update(key.clone(), changes, previous))?;
            Ok(())
        })?;
        for offset in offsets {
            self.publish(LifecycleEvent::Changed {
                key: key.clone(),
                offset,
            });
        }
        Ok(())
    }

    pub fn set_field(&mut self, key: &Key, field: &str, value: Value) -> Result<()> {
        let offset = self
            .model
            .type_of(key)?
            .field_index(field)
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "Type '{}' has no field '{}'",
                    key.entity_type(),
                    field
                ))
            })?;
        self.update_entity(key, vec![(offset, value)])
    }

    pub fn remove_entity(&mut self, key: &Key) -> Result<()> {
        let current = self
            .registry
            .values(key)
            .ok_or_else(|| DbError::EntityNotFound(key.to_string()))?;
        self.edit(|registry| {
            registry.remove(key)?;
            registry.log(Operation::remove(key.clone(), Some(current)))?;
            Ok(())
        })?;
        self.publish(LifecycleEvent::Removed { key: key.clone() });
        Ok(())
    }

    /// Current local values; `None` when unknown locally or removed.
    pub fn get_entity(&self, key: &Key) -> Option<Tuple> {
        self.registry.values(key)
    }

    pub fn read_field(&self, key: &Key, field: &str) -> Result<Option<Value>> {
        let offset = self.model.type_of(key)?.field_index(field).ok_or_else(|| {
            DbError::Validation(format!("Type '{}' has no field '{}'", key.entity_type(), field))
        })?;
        Ok(self.registry.read(key, offset).cloned())
    }

    /// Local values first; the live source only when connected and the key
    /// is unknown locally.
    pub async fn fetch(&mut self, key: &Key) -> Result<Option<Tuple>> {
        if let Some(record) = self.registry.get(key) {
            return Ok(record.values());
        }
        if !self.connected {
            return Ok(None);
        }
        self.load_live(key).await
    }

    /// Re-reads `key` from the attached session and ingests the result with
    /// the configured merge mode.
    pub async fn reload(&mut self, key: &Key) -> Result<Option<Tuple>> {
        self.load_live(key).await
    }

    async fn load_live(&mut self, key: &Key) -> Result<Option<Tuple>> {
        let session = self.session.as_mut().ok_or(DbError::NotAttached)?;
        match session.fetch_by_key(key).await? {
            Some(fresh) => {
                let version = self.model.extract_version(key, &fresh)?;
                self.register_entity_state(key.clone(), fresh, version, self.config.merge_mode)?;
            }
            None if self.registry.get(key).is_some() || self.versions.contains(key) => {
                self.registry.remove_origin(key);
                self.versions.remove(key);
                event!(Level::DEBUG, key = %key, "entity vanished from live source");
                self.publish(LifecycleEvent::Vanished { key: key.clone() });
            }
            None => {}
        }
        Ok(self.registry.values(key))
    }

    // ------------------------------------------------------------------
    // Ingestion and merge
    // ------------------------------------------------------------------

    /// Ingests live data for `key` into the original layer. Local overlays
    /// survive; `mode` decides which origin data and which version win.
    pub fn register_entity_state(
        &mut self,
        key: Key,
        fresh: Tuple,
        version: VersionInfo,
        mode: MergeMode,
    ) -> Result<()> {
        let known = self.versions.get(&key);
        if mode.rejects_conflicts() && !known.is_void() && known != &version {
            return Err(DbError::VersionConflict {
                key: key.to_string(),
                expected: known.to_string(),
                actual: version.to_string(),
            });
        }

        self.registry.update_origin(&key, &fresh, mode.merge_behavior());

        if version.is_void() {
            if mode.clears_on_void() {
                self.versions.remove(&key);
            }
        } else {
            self.versions.add(key.clone(), version.clone(), mode.overwrites_version());
        }

        event!(Level::TRACE, key = %key, version = %version, mode = %mode, "entity state registered");
        self.publish(LifecycleEvent::Materialized { key, version });
        Ok(())
    }

    /// Imports the baseline of `source` with the configured merge mode.
    pub fn merge(&mut self, source: &DisconnectedState) -> Result<()> {
        self.merge_with_mode(source, self.config.merge_mode)
    }

    /// Registers every entity of `source`'s original layer here, with the
    /// version `source` knows for it. All or nothing.
    pub fn merge_with_mode(&mut self, source: &DisconnectedState, mode: MergeMode) -> Result<()> {
        let registry_backup = self.registry.clone();
        let versions_backup = self.versions.clone();

        for record in source.original().local_records() {
            let Some(values) = record.values() else {
                continue;
            };
            let version = source.versions.get(record.key()).clone();
            let key = record.key().clone();
            if let Err(err) = self.register_entity_state(key, values, version, mode) {
                self.registry = registry_backup;
                self.versions = versions_backup;
                return Err(err);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply / cancel
    // ------------------------------------------------------------------

    /// Replays local changes against the attached session.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use rustmemodb_offline::{
    ///     DataType, DisconnectedState, EntityModel, FieldInfo, MemorySource, TypeInfo, Value,
    /// };
    /// use std::sync::Arc;
    ///
    /// # tokio_test::block_on(async {
    /// let model = Arc::new(EntityModel::new().with_type(TypeInfo::new(
    ///     "Customer",
    ///     vec![FieldInfo::new("name", DataType::Text)],
    /// )));
    /// let source = MemorySource::new(model.clone());
    ///
    /// let mut state = DisconnectedState::new(model);
    /// let draft = state.create_entity("Customer", vec![Value::from("Ann")]).unwrap();
    /// state.attach(Box::new(source.session())).await.unwrap();
    /// let mapping = state.apply_changes().await.unwrap();
    /// assert!(mapping.get(&draft).is_some());
    /// # });
    /// ```
    pub async fn apply_changes(&mut self) -> Result<KeyMapping> {
        let mut session = self.session.take().ok_or(DbError::NotAttached)?;
        let outcome = self.apply_to(session.as_mut()).await;
        self.session = Some(session);
        let mapping = outcome?;
        self.remap_attached(&mapping);
        Ok(mapping)
    }

    /// Replays local changes against `target`. On failure local state is
    /// exactly as before the call.
    pub async fn apply_changes_to(&mut self, target: &mut dyn LiveSession) -> Result<KeyMapping> {
        let mapping = self.apply_to(target).await?;
        self.remap_attached(&mapping);
        Ok(mapping)
    }

    async fn apply_to(&mut self, target: &mut dyn LiveSession) -> Result<KeyMapping> {
        self.ensure_no_transaction()?;
        let span = info_span!(
            "offline.apply_changes",
            operations = self.registry.operations().len(),
            target = %target.name()
        );
        self.apply_in_span(target).instrument(span).await
    }

    async fn apply_in_span(&mut self, target: &mut dyn LiveSession) -> Result<KeyMapping> {
        let operations = self.registry.operations().clone();

        let mut validator = self
            .config
            .validate_versions
            .then(|| VersionValidator::new(self.model.clone(), self.versions.clone()));
        let observer = validator.as_mut().map(|v| v as &mut dyn ReplayObserver);
        let mapping = operations.replay(target, observer).await?;

        let mut applied = self.registry.clone();
        applied.commit(true)?;
        let mut original = applied
            .into_origin()
            .ok_or_else(|| DbError::InconsistentState("registry layer has no origin".into()))?;
        original.remap_keys(&mapping);

        let mut versions = self.versions.clone();
        versions.remap_keys(&mapping);
        versions.retain(|key| original.get(key).is_some_and(|record| !record.is_removed()));

        self.registry = StateRegistry::layered(original);
        self.versions = versions;
        self.refresh_versions(target).await;

        event!(Level::INFO, remapped = mapping.len(), "changes applied");
        self.publish(LifecycleEvent::ChangesApplied {
            mapping: mapping.clone(),
        });
        Ok(mapping)
    }

    async fn refresh_versions(&mut self, target: &mut dyn LiveSession) {
        let keys = self.original().all_keys(false);
        if keys.is_empty() {
            return;
        }
        let provider = self.version_provider.clone();
        let refreshed = provider.versions(target, &self.model, &keys).await;
        match refreshed {
            Ok(fresh) => {
                for (key, version) in fresh {
                    if version.is_void() {
                        self.versions.remove(&key);
                    } else {
                        self.versions.add(key, version, true);
                    }
                }
            }
            Err(err) => {
                event!(Level::WARN, error = %err, "version refresh failed, keeping previous versions");
            }
        }
    }

    fn remap_attached(&mut self, mapping: &KeyMapping) {
        if mapping.is_empty() {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            session.remap_references(mapping);
        }
    }

    /// Drops every local change not yet applied.
    pub fn cancel_changes(&mut self) -> Result<()> {
        self.ensure_no_transaction()?;
        let original = self.pop_layer()?;
        self.registry = StateRegistry::layered(original);
        event!(Level::DEBUG, "local changes cancelled");
        self.publish(LifecycleEvent::ChangesCancelled);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn all_keys(&self, include_removed: bool) -> Vec<Key> {
        self.registry.all_keys(include_removed)
    }

    pub fn get_persistence_state(&self, key: &Key) -> Option<PersistenceState> {
        self.registry.persistence_state(key)
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub fn to_snapshot(&self) -> Result<DisconnectedSnapshot> {
        self.ensure_no_transaction()?;
        Ok(DisconnectedSnapshot::new(
            self.original().local_records().cloned().collect(),
            self.registry.local_records().cloned().collect(),
            self.registry.operations().clone(),
            self.versions.clone(),
        ))
    }

    pub fn from_snapshot(
        model: Arc<EntityModel>,
        config: OfflineConfig,
        snapshot: DisconnectedSnapshot,
    ) -> Result<Self> {
        config.validate()?;
        let original = StateRegistry::from_records(snapshot.original);
        let registry = StateRegistry::restore_layer(original, snapshot.local, snapshot.operations);
        let mut state = Self::build(model, config, registry);
        state.versions = snapshot.versions;
        Ok(state)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let snapshot = self.to_snapshot()?;
        SnapshotManager::new(path, self.config.snapshot_format).save(&snapshot)
    }

    pub fn load(
        path: impl AsRef<Path>,
        model: Arc<EntityModel>,
        config: OfflineConfig,
    ) -> Result<Self> {
        let manager = SnapshotManager::new(path, config.snapshot_format);
        let snapshot = manager.load()?.ok_or_else(|| {
            DbError::IoError(format!("no snapshot at {}", manager.path().display()))
        })?;
        Self::from_snapshot(model, config, snapshot)
    }
}
