//! Reopen after an abandoned store

use crate::common::*;
use std::mem;

fn crash(store: SpanStore) {
    mem::forget(store);
}

#[test]
fn live_traces_replay_from_push_log() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store
        .push("acme", &trace_id(1), &fragment(&[SpanSpec::child("db", 2, 1, "q")]))
        .unwrap();
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    crash(store);

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    let report = instance.recovery();
    assert_eq!(report.push_log.records_replayed, 3);
    assert_eq!(report.live_traces, 2);
    assert!(!report.has_issues());
    assert_eq!(instance.live_count(), 2);

    let trace = store.find_trace_by_id("acme", &trace_id(1)).unwrap().unwrap();
    assert_eq!(trace.span_count(), 2);
}

#[test]
fn replayed_traces_survive_a_second_crash() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    crash(store);

    // recovery rotates the log, carrying the live fragments forward
    let store = open_store(&dir);
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    crash(store);

    let store = open_store(&dir);
    assert_eq!(store.instance("acme").unwrap().live_count(), 2);
    assert_eq!(store.search("acme", &SearchRequest::new()).unwrap().traces.len(), 2);
}

#[test]
fn head_files_become_completing_blocks() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    instance.cut_complete_traces(Duration::ZERO, true).unwrap();
    let head_id = instance.head_block_id();
    drop(instance);
    crash(store);

    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.recovery().replayed_heads, 1);
    assert_eq!(instance.completing_block_ids(), vec![head_id]);
    assert_eq!(instance.live_count(), 0);
    assert_ne!(instance.head_block_id(), head_id);

    let stats = store.flush().unwrap();
    assert_eq!(stats.blocks_completed, 1);
    assert_eq!(instance.completed_block_ids(), vec![head_id]);
    assert!(store.find_trace_by_id("acme", &trace_id(1)).unwrap().is_some());
}

#[test]
fn completed_blocks_reopen_with_flush_state() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let config = IngesterConfig {
        flush_grace_period_ms: 60 * 60 * 1000,
        ..test_config(&dir)
    };
    let store = SpanStore::builder()
        .config(config.clone())
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.flush().unwrap();
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    store.ingester().sweep(true);
    crash(store);

    let store = SpanStore::builder()
        .config(config)
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    let instance = store.instance("acme").unwrap();
    let report = instance.recovery();
    assert_eq!(report.completed_blocks, 2);
    assert_eq!(report.flushed_blocks, 2);
    assert!(instance.blocks_to_flush().is_empty());
    assert_eq!(store.search("acme", &SearchRequest::new()).unwrap().traces.len(), 2);
}

#[test]
fn unflushed_blocks_are_flushed_after_reopen() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.flush().unwrap();
    crash(store);

    let backend = Arc::new(MemoryBackend::new());
    let store = SpanStore::builder()
        .config(test_config(&dir))
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.recovery().completed_blocks, 1);
    assert_eq!(instance.blocks_to_flush().len(), 1);

    let stats = store.flush().unwrap();
    assert_eq!(stats.blocks_flushed, 1);
    assert_eq!(backend.object_count(), 2);
}

#[test]
fn clean_close_leaves_nothing_to_replay() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir);
        store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
        store.close().unwrap();
    }
    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.live_count(), 0);
    assert_eq!(instance.recovery().replayed_heads, 1);
    assert!(store.find_trace_by_id("acme", &trace_id(1)).unwrap().is_some());
}
