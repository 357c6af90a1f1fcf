mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use common::{init_tracing, manual_config, open_engine, reopen_engine};
use lsmgraph::{EngineConfig, GraphError, MemStore, Result, StorageEngine};

const NUM_THREADS: usize = 8;
const OPERATIONS_PER_THREAD: usize = 100;

#[test]
fn concurrent_node_creation() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = Arc::new(open_engine(&store, manual_config(4 * 1024)));
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<(String, Vec<u8>)>> {
                barrier.wait();
                let mut created = Vec::new();
                for i in 0..OPERATIONS_PER_THREAD {
                    let payload = format!("t{thread_id}-n{i}").into_bytes();
                    let id = engine.create_node(payload.clone())?;
                    created.push((id, payload));
                }
                Ok(created)
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap()?);
    }
    assert_eq!(all.len(), NUM_THREADS * OPERATIONS_PER_THREAD);
    let unique: BTreeSet<&String> = all.iter().map(|(id, _)| id).collect();
    assert_eq!(unique.len(), all.len());
    for (id, payload) in &all {
        assert_eq!(engine.get_node_data(id)?.as_ref(), payload.as_slice());
    }
    assert!(engine.stats().frozen_memtables > 0);
    Ok(())
}

#[test]
fn concurrent_edges_on_shared_hub() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = Arc::new(open_engine(&store, manual_config(4 * 1024)));
    let hub = engine.create_node(b"hub".to_vec())?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let hub = hub.clone();
            thread::spawn(move || -> Result<Vec<String>> {
                barrier.wait();
                let mut kept = Vec::new();
                for i in 0..25 {
                    let spoke = engine.create_node(Vec::new())?;
                    engine.add_connection(&hub, &spoke)?;
                    if i % 5 == 0 {
                        engine.delete_connection(&hub, &spoke)?;
                    } else {
                        kept.push(spoke);
                    }
                    // Readers race the writers.
                    engine.match_connections(&hub, "")?;
                }
                Ok(kept)
            })
        })
        .collect();

    let mut expected = Vec::new();
    for handle in handles {
        expected.extend(handle.join().unwrap()?);
    }
    expected.sort();
    assert_eq!(engine.match_connections(&hub, "")?, expected);
    Ok(())
}

#[test]
fn background_maintenance_keeps_reads_consistent() -> Result<()> {
    init_tracing();
    let config = EngineConfig::default()
        .memtable_capacity(2 * 1024)
        .worker_threads(2)
        .compaction_trigger_tables(3);
    let engine = Arc::new(StorageEngine::open(Arc::new(MemStore::new()), config)?);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<(String, String)>> {
                barrier.wait();
                let mut edges = Vec::new();
                let mut prev = engine.create_node(format!("root-{t}").into_bytes())?;
                for i in 0..150 {
                    let next = engine.create_node(format!("{t}-{i}").into_bytes())?;
                    engine.add_connection(&prev, &next)?;
                    assert_eq!(engine.match_connections(&prev, "")?, vec![next.clone()]);
                    edges.push((prev, next.clone()));
                    prev = next;
                }
                Ok(edges)
            })
        })
        .collect();

    let mut edges = Vec::new();
    for handle in handles {
        edges.extend(handle.join().unwrap()?);
    }
    engine.rotate_memtable()?;
    engine.trigger_compaction()?;
    let stats = engine.stats();
    assert_eq!(stats.frozen_memtables, 0);
    assert_eq!(stats.sorted_tables, 1);
    for (from, to) in &edges {
        assert_eq!(&engine.match_connections(from, "")?, &vec![to.clone()]);
    }
    Ok(())
}

#[test]
fn concurrent_deletes_of_same_node_succeed_once() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = Arc::new(open_engine(&store, manual_config(64 * 1024)));
    let victim = engine.create_node(b"victim".to_vec())?;
    let barrier = Arc::new(Barrier::new(NUM_THREADS));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let victim = victim.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.delete_node(&victim).is_ok()
            })
        })
        .collect();

    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(successes, 1);
    assert!(!engine.node_exists(&victim));
    Ok(())
}

#[test]
fn writes_acknowledged_during_shutdown_survive_reopen() -> Result<()> {
    let store = Arc::new(MemStore::new());
    let engine = Arc::new(open_engine(&store, manual_config(2 * 1024)));
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<Vec<(String, Vec<u8>)>> {
                barrier.wait();
                let mut acknowledged = Vec::new();
                for i in 0.. {
                    let payload = format!("t{thread_id}-n{i}").into_bytes();
                    match engine.create_node(payload.clone()) {
                        Ok(id) => acknowledged.push((id, payload)),
                        Err(GraphError::Shutdown(_)) => break,
                        Err(err) => return Err(err),
                    }
                }
                Ok(acknowledged)
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(std::time::Duration::from_millis(5));
    engine.shutdown()?;

    let mut acknowledged = Vec::new();
    for handle in handles {
        acknowledged.extend(handle.join().unwrap()?);
    }
    drop(engine);

    let engine = reopen_engine(&store, manual_config(2 * 1024), 1 << 40);
    for (id, payload) in &acknowledged {
        assert_eq!(engine.get_node_data(id)?.as_ref(), payload.as_slice());
    }
    assert_eq!(engine.stats().live_nodes, acknowledged.len());
    Ok(())
}
