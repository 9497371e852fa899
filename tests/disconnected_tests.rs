use async_trait::async_trait;
use rustmemodb_offline::{
    DataType, DbError, DisconnectedState, EntityModel, FieldInfo, Key, KeyMapping, LiveSession,
    MemorySession, MemorySource, MergeMode, OfflineConfig, PersistenceState, Result, Tuple,
    TypeInfo, Value, VersionInfo,
};
use std::sync::Arc;

fn model() -> Arc<EntityModel> {
    Arc::new(
        EntityModel::new()
            .with_type(TypeInfo::new(
                "Customer",
                vec![
                    FieldInfo::new("name", DataType::Text).not_null(),
                    FieldInfo::new("version", DataType::Integer).versioned(),
                ],
            ))
            .with_type(TypeInfo::new(
                "Order",
                vec![
                    FieldInfo::new("customer", DataType::Ref).not_null(),
                    FieldInfo::new("total", DataType::Integer),
                ],
            )),
    )
}

fn customer(id: i64) -> Key {
    Key::new("Customer", vec![Value::Integer(id)])
}

fn v(n: i64) -> VersionInfo {
    VersionInfo::new(vec![Value::Integer(n)])
}

async fn seeded_source() -> MemorySource {
    let source = MemorySource::new(model());
    source
        .put(customer(1), vec![Value::from("Ann"), Value::Integer(1)])
        .await;
    source
        .put(customer(2), vec![Value::from("Bob"), Value::Integer(1)])
        .await;
    source
}

/// Delegates to a memory session and fails the `fail_at`-th write.
struct FailingSession {
    inner: MemorySession,
    fail_at: usize,
    writes: usize,
}

impl FailingSession {
    fn new(inner: MemorySession, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            writes: 0,
        }
    }

    fn count_write(&mut self) -> Result<()> {
        self.writes += 1;
        if self.writes == self.fail_at {
            return Err(DbError::Session("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl LiveSession for FailingSession {
    fn name(&self) -> &str {
        "failing"
    }

    fn model(&self) -> Arc<EntityModel> {
        self.inner.model()
    }

    async fn fetch_by_key(&mut self, key: &Key) -> Result<Option<Tuple>> {
        self.inner.fetch_by_key(key).await
    }

    async fn generate_key(&mut self, entity_type: &str) -> Result<Key> {
        self.inner.generate_key(entity_type).await
    }

    async fn insert(&mut self, key: &Key, values: Tuple) -> Result<()> {
        self.count_write()?;
        self.inner.insert(key, values).await
    }

    async fn update(&mut self, key: &Key, values: Tuple) -> Result<()> {
        self.count_write()?;
        self.inner.update(key, values).await
    }

    async fn remove(&mut self, key: &Key) -> Result<()> {
        self.count_write()?;
        self.inner.remove(key).await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.inner.begin_transaction().await
    }

    async fn commit(&mut self) -> Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.inner.rollback().await
    }

    fn has_open_transaction(&self) -> bool {
        self.inner.has_open_transaction()
    }
}

#[tokio::test]
async fn test_apply_assigns_persistent_key_to_new_entity() {
    let source = MemorySource::new(model());
    let mut state = DisconnectedState::new(model());

    let temporary = state
        .create_entity("Customer", vec![Value::from("A")])
        .unwrap();
    assert_eq!(state.get_persistence_state(&temporary), Some(PersistenceState::New));

    state.attach(Box::new(source.session())).await.unwrap();
    let mapping = state.apply_changes().await.unwrap();

    assert_eq!(mapping.len(), 1);
    assert_eq!(mapping.get(&temporary), Some(&customer(1)));
    assert_eq!(
        state.original().get(&customer(1)).map(|record| record.state()),
        Some(PersistenceState::Synchronized)
    );
    assert_eq!(state.all_keys(false), vec![customer(1)]);
    assert!(state.operations().is_empty());
    assert_eq!(state.versions()[&customer(1)], v(1));
    assert_eq!(
        source.get(&customer(1)).await,
        Some(vec![Value::from("A"), Value::Integer(1)])
    );
}

#[tokio::test]
async fn test_merge_prefer_source_takes_source_data_and_version() {
    let mut a = DisconnectedState::new(model());
    let mut b = DisconnectedState::new(model());
    a.register_entity_state(
        customer(1),
        vec![Value::from("From A"), Value::Integer(1)],
        v(1),
        MergeMode::PreferNew,
    )
    .unwrap();
    b.register_entity_state(
        customer(1),
        vec![Value::from("From B"), Value::Integer(2)],
        v(2),
        MergeMode::PreferNew,
    )
    .unwrap();

    a.merge_with_mode(&b, MergeMode::PreferSource).unwrap();

    assert_eq!(
        a.original().values(&customer(1)),
        Some(vec![Value::from("From B"), Value::Integer(2)])
    );
    assert_eq!(a.versions()[&customer(1)], v(2));
}

#[tokio::test]
async fn test_strict_merge_is_all_or_nothing() {
    let mut a = DisconnectedState::new(model());
    let mut b = DisconnectedState::new(model());
    a.register_entity_state(
        customer(2),
        vec![Value::from("Bob"), Value::Integer(1)],
        v(1),
        MergeMode::PreferNew,
    )
    .unwrap();
    for (id, version) in [(1, 1), (2, 5)] {
        b.register_entity_state(
            customer(id),
            vec![Value::from("B"), Value::Integer(version)],
            v(version),
            MergeMode::PreferNew,
        )
        .unwrap();
    }

    let err = a.merge_with_mode(&b, MergeMode::Strict).unwrap_err();

    assert!(err.is_version_conflict());
    assert!(a.original().get(&customer(1)).is_none());
    assert_eq!(a.versions()[&customer(2)], v(1));
}

#[tokio::test]
async fn test_failed_replay_leaves_local_state_and_source_untouched() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());
    for id in [1, 2] {
        let values = source.get(&customer(id)).await.unwrap();
        state
            .register_entity_state(customer(id), values, v(1), MergeMode::PreferNew)
            .unwrap();
    }
    state.set_field(&customer(1), "name", Value::from("Ann 2")).unwrap();
    state.remove_entity(&customer(2)).unwrap();
    let created = state
        .create_entity("Customer", vec![Value::from("Cid")])
        .unwrap();

    let before = state.to_snapshot().unwrap();

    let mut failing = FailingSession::new(source.session(), 2);
    let err = state.apply_changes_to(&mut failing).await.unwrap_err();
    assert!(matches!(err, DbError::Replay { index: 1, .. }));

    let after = state.to_snapshot().unwrap();
    assert_eq!(after.original, before.original);
    assert_eq!(after.local, before.local);
    assert_eq!(after.operations, before.operations);
    assert_eq!(after.versions, before.versions);
    assert_eq!(state.get_persistence_state(&created), Some(PersistenceState::New));

    assert_eq!(source.len().await, 2);
    assert_eq!(
        source.get(&customer(1)).await,
        Some(vec![Value::from("Ann"), Value::Integer(1)])
    );

    // Retrying against a healthy session succeeds.
    let mapping = state.apply_changes_to(&mut source.session()).await.unwrap();
    assert_eq!(mapping.len(), 1);
    assert!(source.get(&customer(2)).await.is_none());
    assert_eq!(source.len().await, 2);
}

#[tokio::test]
async fn test_version_validation_detects_concurrent_writer() {
    let source = seeded_source().await;
    let config = OfflineConfig::new().validate_versions(true);
    let mut state = DisconnectedState::with_config(model(), config).unwrap();
    state.attach(Box::new(source.session())).await.unwrap();

    state.reload(&customer(1)).await.unwrap();
    state
        .set_field(&customer(1), "name", Value::from("Offline"))
        .unwrap();

    let mut other = source.named_session("other");
    other
        .update(&customer(1), vec![Value::from("Remote"), Value::Integer(1)])
        .await
        .unwrap();

    let err = state.apply_changes().await.unwrap_err();
    assert!(err.is_version_conflict());
    assert_eq!(state.operations().len(), 1);
    assert_eq!(
        source.get(&customer(1)).await,
        Some(vec![Value::from("Remote"), Value::Integer(2)])
    );

    // Refresh the baseline; the local edit survives and now applies.
    state.reload(&customer(1)).await.unwrap();
    assert_eq!(
        state.read_field(&customer(1), "name").unwrap(),
        Some(Value::from("Offline"))
    );
    assert_eq!(state.versions()[&customer(1)], v(2));

    state.apply_changes().await.unwrap();
    assert_eq!(
        source.get(&customer(1)).await,
        Some(vec![Value::from("Offline"), Value::Integer(3)])
    );
    assert_eq!(state.versions()[&customer(1)], v(3));
}

#[tokio::test]
async fn test_references_to_temporary_keys_are_remapped() {
    let source = MemorySource::new(model());
    let mut state = DisconnectedState::new(model());

    let buyer = state
        .create_entity("Customer", vec![Value::from("Ann")])
        .unwrap();
    let order = state
        .create_entity("Order", vec![Value::Ref(buyer.clone()), Value::Integer(10)])
        .unwrap();

    let mapping: KeyMapping = state.apply_changes_to(&mut source.session()).await.unwrap();
    let real_buyer = mapping.get(&buyer).cloned().unwrap();
    let real_order = mapping.get(&order).cloned().unwrap();

    let expected = vec![Value::Ref(real_buyer.clone()), Value::Integer(10)];
    assert_eq!(source.get(&real_order).await, Some(expected.clone()));
    assert_eq!(state.get_entity(&real_order), Some(expected));
    assert!(state.get_entity(&order).is_none());
    assert!(state.get_entity(&real_buyer).is_some());
}

#[tokio::test]
async fn test_connected_scope_reads_through_and_commits_chained_transaction() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());

    assert_eq!(state.fetch(&customer(1)).await.unwrap(), None);

    let mut attached = state
        .attach_scope(Box::new(source.session()))
        .await
        .unwrap();
    {
        let mut connected = attached.connect_scope().unwrap();
        assert!(connected.has_transaction());

        let fetched = connected.fetch(&customer(1)).await.unwrap();
        assert_eq!(fetched, Some(vec![Value::from("Ann"), Value::Integer(1)]));
        assert_eq!(connected.versions()[&customer(1)], v(1));

        connected
            .set_field(&customer(1), "name", Value::from("Changed"))
            .unwrap();
        connected.disconnect().unwrap();
    }

    assert!(!attached.has_transaction());
    assert_eq!(attached.operations().len(), 1);
    assert_eq!(
        attached.get_persistence_state(&customer(1)),
        Some(PersistenceState::Modified)
    );
    attached.detach().unwrap();
    assert!(!state.is_attached());
}

#[tokio::test]
async fn test_protocol_errors() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());

    assert!(matches!(state.detach(), Err(DbError::NotAttached)));
    assert!(matches!(state.connect(), Err(DbError::NotAttached)));
    assert!(matches!(state.apply_changes().await, Err(DbError::NotAttached)));

    state.attach(Box::new(source.session())).await.unwrap();
    assert!(matches!(
        state.attach(Box::new(source.session())).await,
        Err(DbError::AlreadyAttached)
    ));

    state.begin_transaction().unwrap();
    assert!(matches!(state.detach(), Err(DbError::TransactionOpen)));
    assert!(matches!(state.apply_changes().await, Err(DbError::TransactionOpen)));
    state.commit_transaction().unwrap();
    state.detach().unwrap();
}

#[tokio::test]
async fn test_attach_flushes_open_outer_transaction() {
    let source = seeded_source().await;
    let mut session = source.session();
    session.begin_transaction().await.unwrap();
    session
        .insert(&customer(7), vec![Value::from("Outer")])
        .await
        .unwrap();

    let mut state = DisconnectedState::new(model());
    state.attach(Box::new(session)).await.unwrap();
    assert!(state.is_attached());

    let draft = state
        .create_entity("Customer", vec![Value::from("Draft")])
        .unwrap();
    let mapping = state.apply_changes().await.unwrap();

    assert_eq!(mapping.get(&draft), Some(&customer(8)));
    assert_eq!(
        source.get(&customer(7)).await,
        Some(vec![Value::from("Outer"), Value::Integer(1)])
    );
    assert_eq!(
        source.get(&customer(8)).await,
        Some(vec![Value::from("Draft"), Value::Integer(1)])
    );

    let session = state.detach().unwrap();
    assert!(!session.has_open_transaction());
}

#[tokio::test]
async fn test_reload_of_unknown_key_publishes_nothing() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());
    state.attach(Box::new(source.session())).await.unwrap();
    let mut events = state.subscribe();

    assert_eq!(state.reload(&customer(99)).await.unwrap(), None);

    assert!(events.try_recv().is_err());
    assert!(!state.versions().contains(&customer(99)));
    assert!(state.all_keys(true).is_empty());
}

#[tokio::test]
async fn test_vanished_entity_marks_local_edits_inconsistent() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());
    state.attach(Box::new(source.session())).await.unwrap();

    state.reload(&customer(1)).await.unwrap();
    state
        .set_field(&customer(1), "name", Value::from("Edited"))
        .unwrap();
    source.delete(&customer(1)).await;

    let values = state.reload(&customer(1)).await.unwrap();

    assert_eq!(
        state.get_persistence_state(&customer(1)),
        Some(PersistenceState::Inconsistent)
    );
    assert_eq!(values.map(|tuple| tuple[0].clone()), Some(Value::from("Edited")));
    assert!(state.original().get(&customer(1)).is_none());
    assert!(!state.versions().contains(&customer(1)));
}

#[tokio::test]
async fn test_cancel_changes_restores_original_view() {
    let source = seeded_source().await;
    let mut state = DisconnectedState::new(model());
    state.attach(Box::new(source.session())).await.unwrap();
    state.reload(&customer(1)).await.unwrap();

    state.remove_entity(&customer(1)).unwrap();
    state
        .create_entity("Customer", vec![Value::from("Temp")])
        .unwrap();
    assert_eq!(state.all_keys(true).len(), 2);

    state.cancel_changes().unwrap();

    assert!(state.operations().is_empty());
    assert_eq!(state.all_keys(true), vec![customer(1)]);
    assert_eq!(
        state.get_persistence_state(&customer(1)),
        Some(PersistenceState::Synchronized)
    );
}

#[tokio::test]
async fn test_lifecycle_events_follow_apply() {
    let source = MemorySource::new(model());
    let mut state = DisconnectedState::new(model());
    let mut events = state.subscribe();

    let key = state
        .create_entity("Customer", vec![Value::from("Ann")])
        .unwrap();
    let mapping = state.apply_changes_to(&mut source.session()).await.unwrap();

    let mut received = Vec::new();
    while let Ok(event) = events.try_recv() {
        received.push(event);
    }
    assert_eq!(
        received.first(),
        Some(&rustmemodb_offline::LifecycleEvent::Created { key })
    );
    assert_eq!(
        received.last(),
        Some(&rustmemodb_offline::LifecycleEvent::ChangesApplied { mapping })
    );
}
