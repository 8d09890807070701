//! Integration tests for caches, namespaces and sessions on a shared SQLite file.
//!
//! Each test opens separate backends on the same database file, the way
//! independent worker processes would.

use cellar::{
    BackendConfig, Cache, CacheManager, CellarError, NamespaceManager, SessionStore,
    SqliteDocumentStore,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// Create a temp dir and a sqlite configuration pointing into it.
fn create_test_env() -> (TempDir, BackendConfig) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!(
        "sqlite://{}",
        temp_dir.path().join("cellar.sqlite").display()
    );
    (temp_dir, BackendConfig::sqlite(url))
}

fn open_cache(config: &BackendConfig, name: &str) -> Cache {
    let store = SqliteDocumentStore::from_config(config).unwrap();
    Cache::new(
        name,
        NamespaceManager::new(name, Arc::new(store)),
        config.expire_duration(),
    )
}

fn increment(cache: &Cache) -> i64 {
    let value = cache.get_value_or("value", 0i64).unwrap() + 1;
    cache.set_value("value", &value).unwrap();
    value
}

#[test]
fn test_increment_clear_increment() {
    let (_temp, config) = create_test_env();
    let cache = open_cache(&config, "testcache");

    assert_eq!(
        (1..=3).map(|_| increment(&cache)).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    cache.clear().unwrap();
    assert_eq!(
        (1..=3).map(|_| increment(&cache)).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn test_store_none() {
    let (_temp, config) = create_test_env();
    let cache = open_cache(&config, "test");

    cache.set_value("x", &None::<String>).unwrap();
    assert!(cache.contains("x").unwrap());
    assert_eq!(cache.get_value::<Option<String>>("x").unwrap(), None);

    let reopened = open_cache(&config, "test");
    assert_eq!(reopened.get_value::<Option<String>>("x").unwrap(), None);
}

#[test]
fn test_has_key_across_independent_handles() {
    let (_temp, config) = create_test_env();
    let first = open_cache(&config, "test");
    let second = open_cache(&config, "test");

    first.set_value("test", &20).unwrap();
    first.set_value("fred", &10).unwrap();

    assert!(second.contains("test").unwrap());
    assert!(second.contains("fred").unwrap());
    assert_eq!(second.get_value::<i32>("test").unwrap(), 20);

    second.remove_value("test").unwrap();
    assert!(!first.contains("test").unwrap());
    assert!(first.contains("fred").unwrap());

    let other_name = open_cache(&config, "other");
    assert!(!other_name.contains("fred").unwrap());
}

#[test]
fn test_dropping_keys_out_of_band() {
    let (_temp, config) = create_test_env();
    let cache = open_cache(&config, "test");
    cache.set_value("test", &20).unwrap();
    cache.set_value("fred", &10).unwrap();

    let path = config.url.as_deref().unwrap().trim_start_matches("sqlite://");
    let raw = rusqlite::Connection::open(path).unwrap();
    raw.execute(
        r#"UPDATE cellar_documents SET data = json_remove(data, '$."test"') WHERE id = 'test'"#,
        [],
    )
    .unwrap();

    assert!(!cache.contains("test").unwrap());
    assert!(cache.contains("fred").unwrap());

    raw.execute("DELETE FROM cellar_documents WHERE id = 'test'", [])
        .unwrap();
    assert!(!cache.contains("fred").unwrap());
    assert!(cache.get_value::<i32>("fred").unwrap_err().is_not_found());
}

#[test]
fn test_unicode_and_space_keys() {
    let (_temp, config) = create_test_env();
    let cache = open_cache(&config, "test");

    cache.set_value("hiŏ", &"unicode").unwrap();
    cache.set_value("hi ŏ", &"unicode with space").unwrap();
    cache.set_value("has space", &24).unwrap();

    assert_eq!(cache.get_value::<String>("hiŏ").unwrap(), "unicode");
    assert_eq!(
        cache.get_value::<String>("hi ŏ").unwrap(),
        "unicode with space"
    );
    assert_eq!(cache.get_value::<i32>("has space").unwrap(), 24);
    assert!(!cache.contains("hasspace").unwrap());

    let mut keys = cache.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["has space", "hi ŏ", "hiŏ"]);
}

#[test]
fn test_concurrent_caches_keep_every_key() {
    let (_temp, config) = create_test_env();
    // Create the schema before the writers race.
    drop(open_cache(&config, "shared"));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let config = config.clone();
            thread::spawn(move || {
                let cache = open_cache(&config, "shared");
                for i in 0..20 {
                    cache
                        .set_value(&format!("worker {} item {}", worker, i), &json!({"i": i}))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = open_cache(&config, "shared");
    assert_eq!(cache.keys().unwrap().len(), 80);
}

#[test]
fn test_locked_counter_across_handles() {
    let (_temp, config) = create_test_env();
    drop(open_cache(&config, "counter"));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let config = config.clone();
            thread::spawn(move || {
                let cache = open_cache(&config, "counter");
                for _ in 0..10 {
                    cache.update_value("hits", 0i64, |n| n + 1).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let cache = open_cache(&config, "counter");
    assert_eq!(cache.get_value::<i64>("hits").unwrap(), 40);
}

#[test]
fn test_cache_manager_roundtrip() {
    let (_temp, config) = create_test_env();
    let manager = CacheManager::with_defaults();

    let writer = manager.get_cache("test", &config).unwrap();
    writer.set_value("value", &"hello").unwrap();

    let reader = manager.get_cache("test", &config).unwrap();
    assert!(Arc::ptr_eq(&writer, &reader));
    assert_eq!(reader.get_value::<String>("value").unwrap(), "hello");

    reader.clear().unwrap();
    let err = manager
        .get_cache("test", &config)
        .unwrap()
        .get_value::<String>("value")
        .unwrap_err();
    assert!(matches!(err, CellarError::ValueNotFound { .. }));
}

#[test]
fn test_expired_entries_read_as_missing() {
    let (_temp, config) = create_test_env();
    let cache = open_cache(&config.clone().with_expire(1), "short");

    cache.set_value("k", &"v").unwrap();
    assert!(cache.contains("k").unwrap());

    thread::sleep(Duration::from_millis(1100));
    assert!(!cache.contains("k").unwrap());
    assert_eq!(cache.get_value_or("k", "default".to_string()).unwrap(), "default");
    assert_eq!(cache.purge_expired().unwrap(), 1);
}

#[test]
fn test_unavailable_backend_is_not_absence() {
    let temp_dir = TempDir::new().unwrap();
    // A directory cannot be opened as a database file.
    let config = BackendConfig::sqlite(temp_dir.path().display().to_string());
    let err = SqliteDocumentStore::from_config(&config).err().unwrap();
    assert!(!err.is_not_found());
}

#[test]
fn test_session_increment_and_adopt_by_id() {
    let (_temp, config) = create_test_env();
    let manager = CacheManager::with_defaults();
    let store = manager.session_store(&config).unwrap();

    let mut session = store.new_session();
    session.insert("value", &1).unwrap();
    session.save().unwrap();
    let id = session.id().to_string();

    // Another worker with its own connection adopts the session by id.
    let other = SessionStore::new(Arc::new(SqliteDocumentStore::from_config(&config).unwrap()));
    let mut adopted = other.get_by_id(&id).unwrap().expect("session should exist");
    let value = adopted.get::<i32>("value").unwrap().unwrap_or(0) + 1;
    adopted.insert("value", &value).unwrap();
    adopted.save().unwrap();

    let reloaded = store.get_by_id(&id).unwrap().unwrap();
    assert_eq!(reloaded.get::<i32>("value").unwrap(), Some(2));

    assert!(store
        .get_by_id("0123456789abcdef0123456789abcdef")
        .unwrap()
        .is_none());
}
