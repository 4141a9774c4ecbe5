use sb_subscribe::exclusions::STORE_VERSION;
use sb_subscribe::model::identity_hash;
use sb_subscribe::{ExclusionRegistry, ExclusionStore, ProtocolKind, StoreError};
use serde_json::Value;
use std::fs;

fn id(tag: &str) -> String {
    identity_hash(tag, ProtocolKind::Shadowsocks, 8388)
}

#[test]
fn duplicate_add_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut store = ExclusionStore::new(dir.path().join("ex.json"));
    assert!(store.add(&id("hk-01"), "hk-01", Some("slow"))?);
    assert!(!store.add(&id("hk-01"), "hk-01 again", None)?);
    let all = store.list_all()?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "hk-01");
    Ok(())
}

#[test]
fn persisted_file_matches_schema() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ex.json");
    let mut store = ExclusionStore::new(&path);
    store.add(&id("a"), "a", None)?;
    store.add(&id("b"), "b", Some("blocked upstream"))?;

    let v: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
    assert_eq!(v["version"], STORE_VERSION);
    assert!(v["last_modified"].as_str().unwrap().ends_with('Z'));
    let entries = v["exclusions"].as_array().unwrap();
    assert_eq!(entries[0]["id"], id("a"));
    assert!(entries[0].get("reason").is_none());
    assert_eq!(entries[1]["reason"], "blocked upstream");
    assert!(entries[1]["timestamp"].as_str().unwrap().ends_with('Z'));
    Ok(())
}

#[test]
fn round_trip_from_every_schema_version() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let legacy_array = serde_json::json!([id("a"), { "identity": id("b"), "name": "b", "added_at": "2023-01-01T00:00:00Z" }]);
    let legacy_object = serde_json::json!({ "exclusions": [{ "id": id("a"), "name": "a" }, { "id": id("b"), "name": "b", "reason": "r" }] });
    let current = serde_json::json!({
        "version": 1,
        "last_modified": "2024-05-01T00:00:00Z",
        "exclusions": [
            { "id": id("a"), "name": "a", "timestamp": "2024-05-01T00:00:00Z" },
            { "id": id("b"), "name": "b", "reason": "r", "timestamp": "2024-05-01T00:00:00Z" }
        ]
    });

    for (i, doc) in [legacy_array, legacy_object, current].iter().enumerate() {
        let path = dir.path().join(format!("store-{i}.json"));
        fs::write(&path, serde_json::to_vec(doc)?)?;

        let mut store = ExclusionStore::new(&path);
        let ids: Vec<String> = store.list_all()?.into_iter().map(|e| e.id).collect();
        assert_eq!(ids, [id("a"), id("b")]);

        // whatever it started as, the file on disk is now current
        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        if i < 2 {
            assert_eq!(on_disk["version"], STORE_VERSION);
        }

        let mut reopened = ExclusionStore::new(&path);
        let before = store.list_all()?;
        let after = reopened.list_all()?;
        assert_eq!(before.len(), after.len());
        for (x, y) in before.iter().zip(&after) {
            assert_eq!((&x.id, &x.name, &x.reason), (&y.id, &y.name, &y.reason));
        }
        let expected = if i == 0 { None } else { Some("r") };
        assert_eq!(after[1].reason.as_deref(), expected);
        assert_eq!(after[0].reason, None);
    }
    Ok(())
}

#[test]
fn newer_schema_is_refused() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("future.json");
    fs::write(&path, r#"{"version": 9, "exclusions": []}"#)?;
    let mut store = ExclusionStore::new(&path);
    assert!(matches!(
        store.list_all(),
        Err(StoreError::UnsupportedVersion { found: 9, .. })
    ));
    Ok(())
}

#[test]
fn registry_shares_by_path() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let registry = ExclusionRegistry::new();
    let a = registry.open(dir.path().join("shared.json"));
    let b = registry.open(dir.path().join(".").join("shared.json"));
    let other = registry.open(dir.path().join("other.json"));
    assert_eq!(registry.len(), 2);

    a.lock().add(&id("x"), "x", None)?;
    assert!(b.lock().contains(&id("x"))?);
    assert!(!other.lock().contains(&id("x"))?);
    Ok(())
}

#[test]
fn remove_and_clear_persist() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ex.json");
    let mut store = ExclusionStore::new(&path);
    let added = store.add_many(vec![
        (id("a"), "a".to_string(), None),
        (id("b"), "b".to_string(), None),
        (id("a"), "dup".to_string(), None),
    ])?;
    assert_eq!(added, 2);
    assert!(store.remove(&id("a"))?);
    assert!(!store.remove(&id("a"))?);
    assert_eq!(ExclusionStore::new(&path).len()?, 1);
    assert_eq!(store.clear()?, 1);
    assert!(ExclusionStore::new(&path).is_empty()?);
    Ok(())
}

#[test]
fn failed_write_keeps_store_consistent() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let parent = dir.path().join("data");
    let path = parent.join("ex.json");
    let mut store = ExclusionStore::new(&path);
    store.add_many(vec![
        (id("a"), "a".to_string(), None),
        (id("b"), "b".to_string(), Some("r".to_string())),
    ])?;

    fs::remove_dir_all(&parent)?;
    fs::write(&parent, b"not a directory")?;

    assert!(store.add(&id("c"), "c", None).is_err());
    assert!(!store.contains(&id("c"))?);
    // retrying still fails
    assert!(store.add(&id("c"), "c", None).is_err());
    assert!(store
        .add_many(vec![(id("d"), "d".to_string(), None)])
        .is_err());
    assert!(store.remove(&id("a")).is_err());
    assert!(store.clear().is_err());

    let ids: Vec<String> = store.list_all()?.into_iter().map(|e| e.id).collect();
    assert_eq!(ids, [id("a"), id("b")]);

    fs::remove_file(&parent)?;
    assert!(store.add(&id("c"), "c", None)?);
    assert_eq!(ExclusionStore::new(&path).len()?, 3);
    Ok(())
}
