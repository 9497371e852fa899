use rustmemodb_offline::{
    DataType, DisconnectedState, EntityModel, FieldInfo, Key, MemorySource, MergeMode,
    OfflineConfig, PersistenceState, SnapshotFormat, TypeInfo, Value, VersionInfo,
};
use std::sync::Arc;
use tempfile::tempdir;

fn model() -> Arc<EntityModel> {
    Arc::new(EntityModel::new().with_type(TypeInfo::new(
        "Customer",
        vec![
            FieldInfo::new("name", DataType::Text).not_null(),
            FieldInfo::new("version", DataType::Integer).versioned(),
        ],
    )))
}

fn customer(id: i64) -> Key {
    Key::new("Customer", vec![Value::Integer(id)])
}

fn offline_state() -> (DisconnectedState, Key) {
    let mut state = DisconnectedState::new(model());
    state
        .register_entity_state(
            customer(1),
            vec![Value::from("Ann"), Value::Integer(1)],
            VersionInfo::new(vec![Value::Integer(1)]),
            MergeMode::PreferNew,
        )
        .unwrap();
    state
        .register_entity_state(
            customer(2),
            vec![Value::from("Bob"), Value::Integer(1)],
            VersionInfo::new(vec![Value::Integer(1)]),
            MergeMode::PreferNew,
        )
        .unwrap();
    state
        .set_field(&customer(1), "name", Value::from("Ann 2"))
        .unwrap();
    state.remove_entity(&customer(2)).unwrap();
    let created = state
        .create_entity("Customer", vec![Value::from("Cid")])
        .unwrap();
    (state, created)
}

#[tokio::test]
async fn test_save_and_load_round_trip_in_both_formats() {
    let dir = tempdir().unwrap();

    for format in [SnapshotFormat::MessagePack, SnapshotFormat::Json] {
        let path = dir.path().join(format!("{:?}.snapshot", format));
        let config = OfflineConfig::new().snapshot_format(format);
        let (state, created) = offline_state();
        let state = {
            let snapshot = state.to_snapshot().unwrap();
            DisconnectedState::from_snapshot(model(), config.clone(), snapshot).unwrap()
        };
        state.save(&path).unwrap();

        let loaded = DisconnectedState::load(&path, model(), config).unwrap();

        let mut expected_keys = state.all_keys(true);
        let mut loaded_keys = loaded.all_keys(true);
        expected_keys.sort_by_cached_key(|key| key.to_string());
        loaded_keys.sort_by_cached_key(|key| key.to_string());
        assert_eq!(loaded_keys, expected_keys);

        assert_eq!(loaded.operations(), state.operations());
        assert_eq!(loaded.versions(), state.versions());
        assert_eq!(
            loaded.get_entity(&customer(1)),
            Some(vec![Value::from("Ann 2"), Value::Integer(1)])
        );
        assert_eq!(
            loaded.get_persistence_state(&customer(1)),
            Some(PersistenceState::Modified)
        );
        assert_eq!(
            loaded.get_persistence_state(&customer(2)),
            Some(PersistenceState::Removed)
        );
        assert_eq!(
            loaded.get_persistence_state(&created),
            Some(PersistenceState::New)
        );
        assert_eq!(
            loaded
                .local()
                .get_local(&customer(1))
                .and_then(|record| record.snapshot())
                .map(|snapshot| snapshot.overlay().count()),
            Some(1)
        );
    }
}

#[tokio::test]
async fn test_loaded_state_applies_its_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("offline.snapshot");
    let (state, created) = offline_state();
    state.save(&path).unwrap();
    drop(state);

    let source = MemorySource::new(model());
    source
        .put(customer(1), vec![Value::from("Ann"), Value::Integer(1)])
        .await;
    source
        .put(customer(2), vec![Value::from("Bob"), Value::Integer(1)])
        .await;

    let mut loaded = DisconnectedState::load(&path, model(), OfflineConfig::new()).unwrap();
    loaded.attach(Box::new(source.session())).await.unwrap();
    let mapping = loaded.apply_changes().await.unwrap();

    assert_eq!(mapping.get(&created), Some(&customer(3)));
    assert_eq!(
        source.get(&customer(1)).await,
        Some(vec![Value::from("Ann 2"), Value::Integer(2)])
    );
    assert!(source.get(&customer(2)).await.is_none());
    assert_eq!(
        source.get(&customer(3)).await,
        Some(vec![Value::from("Cid"), Value::Integer(1)])
    );
}

#[test]
fn test_load_missing_snapshot_fails() {
    let dir = tempdir().unwrap();
    let result = DisconnectedState::load(dir.path().join("missing"), model(), OfflineConfig::new());
    assert!(result.is_err());
}
