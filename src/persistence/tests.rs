use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;

use super::documents::{CARD_CONFIGS, EXPORT_VERSION};
use super::{Documents, KeyValueStore, MemoryStore, SledStore, get_typed};
use crate::config::{ConnectionConfig, sanitize};

fn memory_documents() -> (Arc<MemoryStore>, Documents) {
    let store = Arc::new(MemoryStore::new("popdash_"));
    (store.clone(), Documents::new(store))
}

#[test]
fn test_memory_store_prefixes_keys() {
    let store = MemoryStore::new("popdash_");
    assert!(store.set("theme", &json!("dark")));

    assert_eq!(store.get("theme"), Some(json!("dark")));
    assert_eq!(store.load("popdash_theme").unwrap(), Some(json!("dark")));
    assert!(store.has("theme"));
    assert!(!store.has("missing"));
}

#[test]
fn test_get_or_falls_back_to_default() {
    let store = MemoryStore::new("p_");
    assert_eq!(store.get_or("missing", json!([])), json!([]));
}

#[test]
fn test_clear_all_only_touches_own_prefix() {
    let store = MemoryStore::new("popdash_");
    store.set("a", &json!(1));
    store.set("b", &json!(2));
    store.store("other_app_key", &json!(3)).unwrap();

    assert!(store.clear_all());

    assert!(!store.has("a"));
    assert!(!store.has("b"));
    assert_eq!(store.load("other_app_key").unwrap(), Some(json!(3)));
}

#[test]
fn test_sled_store_persists_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let path = path.to_str().unwrap();

    {
        let store = SledStore::open(path, "popdash_").unwrap();
        assert!(store.set("saved_connections", &json!([{ "name": "local" }])));
        store.flush().unwrap();
    }

    let store = SledStore::open(path, "popdash_").unwrap();
    assert_eq!(
        store.get("saved_connections"),
        Some(json!([{ "name": "local" }]))
    );
    assert!(store.remove("saved_connections"));
    assert!(!store.has("saved_connections"));
}

#[test]
fn test_sled_store_clear_all() {
    let dir = tempdir().unwrap();
    let store = SledStore::open(dir.path().to_str().unwrap(), "popdash_").unwrap();
    store.set("one", &json!(1));
    store.set("two", &json!(2));

    assert!(store.clear_all());
    assert!(store.keys().unwrap().is_empty());
}

#[test]
fn test_get_typed_treats_malformed_as_absent() {
    let store = MemoryStore::new("p_");
    store.set("connection_config", &json!("not an object"));

    let config: Option<ConnectionConfig> = get_typed(&store, "connection_config");
    assert!(config.is_none());
}

#[test]
fn test_connection_config_round_trip() {
    let (_, documents) = memory_documents();
    let config = ConnectionConfig::new(["ws://localhost:8080"])
        .named("local")
        .with_userpass("alice", "secret");

    assert!(documents.set_connection_config(&sanitize(&config)));

    let restored = documents.connection_config().unwrap();
    assert_eq!(restored.name.as_deref(), Some("local"));
    assert_eq!(restored.username, "alice");
    assert_eq!(restored.password, "[REDACTED]");
    assert!(restored.has_redacted_credentials());
}

#[test]
fn test_dashboard_config_round_trips_unchanged() {
    let (_, documents) = memory_documents();
    let layout = json!({ "layout": [{ "id": "c1", "x": 0, "y": 0 }], "timestamp": 42 });

    assert!(documents.set_dashboard_config(&layout));
    assert_eq!(documents.dashboard_config(), Some(layout));
}

#[test]
fn test_dashboard_config_rejects_non_objects() {
    let (_, documents) = memory_documents();
    assert!(!documents.set_dashboard_config(&json!("nope")));
    assert!(documents.dashboard_config().is_none());
}

#[test]
fn test_card_configs_are_wrapped() {
    let (store, documents) = memory_documents();
    let configs = json!({ "c1": { "topic": "a.b" } });

    assert!(documents.set_card_configs(&configs));

    let stored = store.get(CARD_CONFIGS).unwrap();
    assert_eq!(stored["configs"], configs);
    assert!(stored["timestamp"].is_i64());
    assert_eq!(documents.card_configs(), configs);
}

#[test]
fn test_card_configs_default_to_empty_object() {
    let (_, documents) = memory_documents();
    assert_eq!(documents.card_configs(), json!({}));
}

#[test]
fn test_user_preferences_merge_defaults() {
    let (_, documents) = memory_documents();
    assert_eq!(documents.user_preferences()["theme"], "light");

    assert!(documents.update_user_preference("theme", json!("dark")));

    let preferences = documents.user_preferences();
    assert_eq!(preferences["theme"], "dark");
    assert_eq!(preferences["gridOptions"]["cellHeight"], 100);
    assert_eq!(preferences["notifications"]["errors"], true);
}

#[test]
fn test_export_then_import_into_fresh_store() {
    let (_, source) = memory_documents();
    source.set_dashboard_config(&json!({ "layout": [] }));
    source.set_card_configs(&json!({ "c1": { "topic": "a" } }));
    source.update_user_preference("theme", json!("dark"));

    let bundle = source.export_config();
    assert_eq!(bundle["version"], EXPORT_VERSION);
    assert!(bundle["exportTimestamp"].is_i64());

    let (_, target) = memory_documents();
    assert!(target.import_config(&bundle));
    assert_eq!(target.dashboard_config(), Some(json!({ "layout": [] })));
    assert_eq!(target.card_configs(), json!({ "c1": { "topic": "a" } }));
    assert_eq!(target.user_preferences()["theme"], "dark");
}

#[test]
fn test_import_rejects_non_object_bundle() {
    let (_, documents) = memory_documents();
    assert!(!documents.import_config(&json!([1, 2, 3])));
}
