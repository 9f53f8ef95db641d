//! Integration tests for the sticky backends
//!
//! The SQLite backend is tested both in memory and against real files

use std::sync::Arc;

use forwarder_router::{RouteToken, Tier};
use forwarder_sticky::{
    DatabaseStorage, MemoryStorage, StickyError, StickyMapper, StickyStorage, MEMORY_STORAGE,
};

async fn memory_db() -> DatabaseStorage {
    DatabaseStorage::connect("sqlite::memory:", "memory")
        .await
        .expect("Failed to open in-memory database")
}

async fn check_first_store_then_overwrite(storage: &dyn StickyStorage) {
    assert_eq!(storage.load("10.0.0.1").await.unwrap(), None);

    storage
        .save("10.0.0.1", RouteToken::Tier(Tier::Two))
        .await
        .unwrap();
    // Same key resolves the same route on every later lookup
    for _ in 0..3 {
        assert_eq!(
            storage.load("10.0.0.1").await.unwrap(),
            Some(RouteToken::Tier(Tier::Two))
        );
    }

    storage.save("10.0.0.1", RouteToken::Direct).await.unwrap();
    assert_eq!(
        storage.load("10.0.0.1").await.unwrap(),
        Some(RouteToken::Direct)
    );

    let entries = storage.list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].client_key, "10.0.0.1");
    assert_eq!(entries[0].route, RouteToken::Direct);
    assert!(entries[0].updated_at >= entries[0].created_at);
}

#[tokio::test]
async fn test_memory_storage() {
    check_first_store_then_overwrite(&MemoryStorage::new()).await;
}

#[tokio::test]
async fn test_database_storage() {
    let storage = memory_db().await;
    check_first_store_then_overwrite(&storage).await;
}

#[tokio::test]
async fn test_list_is_ordered() {
    let storage = memory_db().await;
    storage.save("10.0.0.9", RouteToken::Direct).await.unwrap();
    storage
        .save("10.0.0.10", RouteToken::Tier(Tier::One))
        .await
        .unwrap();
    storage
        .save("192.168.1.1", RouteToken::Tier(Tier::Three))
        .await
        .unwrap();

    let keys: Vec<String> = storage
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.client_key)
        .collect();
    assert_eq!(keys, vec!["10.0.0.10", "10.0.0.9", "192.168.1.1"]);
}

#[tokio::test]
async fn test_entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sticky.db");
    let path = path.to_str().unwrap();

    let storage = DatabaseStorage::open(path).await.unwrap();
    storage
        .save("172.16.0.5", RouteToken::Tier(Tier::Three))
        .await
        .unwrap();
    storage.close().await.unwrap();

    let reopened = DatabaseStorage::open(path).await.unwrap();
    assert_eq!(
        reopened.load("172.16.0.5").await.unwrap(),
        Some(RouteToken::Tier(Tier::Three))
    );
}

#[tokio::test]
async fn test_second_opener_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sticky.db");
    let path = path.to_str().unwrap();

    let _owner = DatabaseStorage::open(path).await.unwrap();

    let second = DatabaseStorage::open(path).await;
    assert!(matches!(
        second,
        Err(StickyError::Open { .. }) | Err(StickyError::Locked { .. })
    ));
}

#[tokio::test]
async fn test_mapper_selects_backend() {
    let mapper = StickyMapper::open(MEMORY_STORAGE).await.unwrap();
    mapper.store("10.1.1.1", RouteToken::Direct).await.unwrap();
    assert_eq!(
        mapper.lookup("10.1.1.1").await.unwrap(),
        Some(RouteToken::Direct)
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mapper.db");
    let mapper = StickyMapper::open(path.to_str().unwrap()).await.unwrap();
    mapper
        .store("10.1.1.2", RouteToken::Tier(Tier::One))
        .await
        .unwrap();
    assert_eq!(mapper.entries().await.unwrap().len(), 1);
    assert!(path.exists());
}

#[tokio::test]
async fn test_concurrent_stores() {
    let mapper = StickyMapper::new(Arc::new(memory_db().await));

    let mut handles = Vec::new();
    for i in 0..20 {
        let mapper = mapper.clone();
        handles.push(tokio::spawn(async move {
            mapper
                .store(&format!("10.2.0.{}", i), RouteToken::Tier(Tier::Two))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(mapper.entries().await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_mapper_close_releases_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sticky.db");
    let path = path.to_str().unwrap();

    let mapper = StickyMapper::open(path).await.unwrap();
    mapper.store("10.3.0.1", RouteToken::Direct).await.unwrap();
    mapper.close().await.unwrap();
    assert!(mapper.lookup("10.3.0.1").await.is_err());

    let reopened = StickyMapper::open(path).await.unwrap();
    assert_eq!(
        reopened.lookup("10.3.0.1").await.unwrap(),
        Some(RouteToken::Direct)
    );

    // Memory storage has nothing to release
    StickyMapper::in_memory().close().await.unwrap();
}
