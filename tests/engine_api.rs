mod common;

use std::sync::Arc;

use common::{init_tracing, manual_config, open_engine};
use lsmgraph::{
    CounterMetrics, EngineConfig, GraphError, MemStore, RandomIds, Result, StorageEngine,
};

#[test]
fn graph_round_trip_in_memory() -> Result<()> {
    init_tracing();
    let engine = StorageEngine::open_in_memory()?;
    let alice = engine.create_node_in_class("user", b"alice".to_vec())?;
    let bob = engine.create_node_in_class("user", b"bob".to_vec())?;
    let post = engine.create_node_in_class("post", b"hello world".to_vec())?;
    assert!(alice.starts_with("user"));
    assert!(post.starts_with("post"));

    engine.add_connection(&alice, &bob)?;
    engine.add_connection(&alice, &post)?;
    engine.add_connection(&bob, &alice)?;

    assert_eq!(engine.match_connections(&alice, "user")?, vec![bob.clone()]);
    assert_eq!(engine.match_connections(&alice, "post")?, vec![post.clone()]);
    let mut all = vec![bob.clone(), post.clone()];
    all.sort();
    assert_eq!(engine.match_connections(&alice, "")?, all);
    assert_eq!(engine.match_connections(&bob, "")?, vec![alice.clone()]);
    assert!(engine.match_connections(&post, "")?.is_empty());

    assert_eq!(engine.get_node_data(&post)?.as_ref(), b"hello world");
    engine.shutdown()?;
    Ok(())
}

#[test]
fn delete_then_readd_edge() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = open_engine(&store, manual_config(64 * 1024));
    let a = engine.create_node(b"a".to_vec())?;
    let b = engine.create_node(b"b".to_vec())?;
    engine.add_connection(&a, &b)?;
    engine.delete_connection(&a, &b)?;
    assert!(engine.match_connections(&a, "")?.is_empty());
    engine.add_connection(&a, &b)?;
    assert_eq!(engine.match_connections(&a, "")?, vec![b.clone()]);
    // Deleting an edge that was never added is recorded, not rejected.
    engine.delete_connection(&b, &a)?;
    assert!(engine.match_connections(&b, "")?.is_empty());
    Ok(())
}

#[test]
fn deleted_node_disappears_everywhere() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = open_engine(&store, manual_config(64 * 1024));
    let a = engine.create_node(b"a".to_vec())?;
    let b = engine.create_node(b"b".to_vec())?;
    engine.add_connection(&a, &b)?;
    engine.add_connection(&b, &a)?;
    assert_eq!(engine.match_connections(&a, "")?.len(), 1);

    engine.delete_node(&a)?;
    assert!(!engine.node_exists(&a));
    for result in [
        engine.get_node_data(&a).map(|_| ()),
        engine.match_connections(&a, "").map(|_| ()),
        engine.add_connection(&a, &b),
        engine.add_connection(&b, &a),
        engine.delete_node(&a),
    ] {
        assert!(matches!(result, Err(GraphError::InvalidArgument(_))));
    }
    assert_eq!(engine.get_node_data(&b)?.as_ref(), b"b");
    Ok(())
}

#[test]
fn payloads_of_any_size_survive_flush() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = open_engine(&store, manual_config(64 * 1024));
    let empty = engine.create_node(Vec::new())?;
    let large = engine.create_node(vec![7u8; 256 * 1024])?;
    engine.rotate_memtable()?;
    engine.trigger_flush()?;
    assert!(engine.get_node_data(&empty)?.is_empty());
    assert_eq!(engine.get_node_data(&large)?.len(), 256 * 1024);
    Ok(())
}

#[test]
fn metrics_observe_engine_activity() -> Result<()> {
    let metrics = Arc::new(CounterMetrics::default());
    let engine = StorageEngine::builder(Arc::new(MemStore::new()))
        .config(manual_config(64 * 1024))
        .ids(Arc::new(RandomIds::seeded(42)))
        .metrics(metrics.clone())
        .open()?;
    let a = engine.create_node(b"a".to_vec())?;
    let b = engine.create_node(b"b".to_vec())?;
    engine.add_connection(&a, &b)?;
    engine.delete_connection(&a, &b)?;
    engine.match_connections(&a, "")?;
    engine.match_connections(&a, "")?;
    engine.delete_node(&b)?;
    engine.rotate_memtable()?;
    engine.trigger_flush()?;

    let snap = metrics.snapshot();
    assert_eq!(snap.nodes_created, 2);
    assert_eq!(snap.nodes_deleted, 1);
    assert_eq!((snap.edges_added, snap.edges_removed), (1, 1));
    assert_eq!((snap.cache_hits, snap.cache_misses), (1, 1));
    assert_eq!(snap.memtable_rotations, 1);
    assert_eq!((snap.flushes, snap.tables_flushed), (1, 1));
    Ok(())
}

#[test]
fn config_loads_from_toml() -> Result<()> {
    let config = EngineConfig::from_toml_str(
        r#"
        memtable_capacity = 2048
        cache_capacity = 16
        worker_threads = 2
        sync_mode = "batched"
        log_batch_entries = 8
        "#,
    )?;
    let engine = StorageEngine::open(Arc::new(MemStore::new()), config)?;
    assert_eq!(engine.config().memtable_capacity, 2048);
    let id = engine.create_node(b"x".to_vec())?;
    engine.flush_log()?;
    assert_eq!(engine.get_node_data(&id)?.as_ref(), b"x");
    Ok(())
}

#[test]
fn directory_store_persists_across_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (a, b) = {
        let engine = StorageEngine::open_dir(dir.path(), manual_config(1024))?;
        let a = engine.create_node(b"first".to_vec())?;
        let b = engine.create_node(b"second".to_vec())?;
        engine.add_connection(&a, &b)?;
        (a, b)
    };
    let engine = StorageEngine::open_dir(dir.path(), manual_config(1024))?;
    assert_eq!(engine.get_node_data(&a)?.as_ref(), b"first");
    assert_eq!(engine.match_connections(&a, "")?, vec![b]);
    assert!(dir.path().join("MANIFEST").exists());
    Ok(())
}
