//! Forced flushes, the flush backend and local clearing

use crate::common::*;
use spanstore_core::{BlockId, IngesterConfig};

fn backend_blocks(backend: &MemoryBackend, tenant: &str) -> Vec<BlockId> {
    backend.list_blocks(&Context::background(), tenant).unwrap()
}

#[test]
fn flush_without_backend_keeps_blocks_local() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    for n in 1..=3 {
        store.push("acme", &trace_id(n), &root_fragment("api", "op")).unwrap();
    }

    let stats = store.flush().unwrap();
    assert_eq!(stats.traces_cut, 3);
    assert_eq!(stats.blocks_cut, 1);
    assert_eq!(stats.blocks_completed, 1);
    assert_eq!(stats.blocks_flushed, 0);
    assert_eq!(stats.blocks_cleared, 0);

    let instance = store.instance("acme").unwrap();
    assert_eq!(instance.completed_block_ids().len(), 1);
    let response = store.search("acme", &SearchRequest::new()).unwrap();
    assert_eq!(response.traces.len(), 3);
    // the fresh head and the completed block
    assert_eq!(response.metrics.inspected_blocks, 2);
}

#[test]
fn flush_writes_to_backend_then_clears_locally() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let store = SpanStore::builder()
        .config(test_config(&dir))
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    store.push("acme", &trace_id(1), &root_fragment("api", "op")).unwrap();

    let stats = store.flush().unwrap();
    assert_eq!(stats.blocks_flushed, 1);
    assert_eq!(stats.blocks_cleared, 1);

    let blocks = backend_blocks(&backend, "acme");
    assert_eq!(blocks.len(), 1);
    let meta = backend
        .read_meta(&Context::background(), "acme", blocks[0])
        .unwrap();
    assert_eq!(meta.total_objects, 1);
    assert_eq!(meta.tenant, "acme");

    let instance = store.instance("acme").unwrap();
    assert!(instance.completed_block_ids().is_empty());
    assert!(!dir.path().join("blocks").join("acme").join(blocks[0].to_string()).exists());
}

#[test]
fn grace_period_keeps_flushed_blocks_searchable() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let config = IngesterConfig {
        flush_grace_period_ms: 60 * 60 * 1000,
        ..test_config(&dir)
    };
    let store = SpanStore::builder()
        .config(config)
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    store.push("acme", &trace_id(1), &root_fragment("api", "op")).unwrap();

    let stats = store.flush().unwrap();
    assert_eq!(stats.blocks_flushed, 1);
    assert_eq!(stats.blocks_cleared, 0);
    assert_eq!(backend_blocks(&backend, "acme").len(), 1);

    let instance = store.instance("acme").unwrap();
    let block_id = instance.completed_block_ids()[0];
    assert!(instance.completed_block(block_id).unwrap().flushed_at().is_some());
    assert!(instance.blocks_to_flush().is_empty());
    assert_eq!(store.search("acme", &SearchRequest::new()).unwrap().traces.len(), 1);

    // a second sweep does not flush the same block again
    assert_eq!(store.flush().unwrap().blocks_flushed, 0);
}

#[test]
fn background_workers_drive_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(MemoryBackend::new());
    let config = IngesterConfig {
        max_block_traces: 1,
        ..test_config(&dir)
    };
    let store = SpanStore::builder()
        .config(config)
        .flush_backend(backend.clone())
        .open()
        .unwrap();
    store.start().unwrap();
    store.push("acme", &trace_id(1), &root_fragment("api", "op")).unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    while backend_blocks(&backend, "acme").is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(backend_blocks(&backend, "acme").len(), 1);
    store.close().unwrap();
}
