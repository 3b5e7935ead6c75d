//! Racing writers, cutters and readers

use crate::common::*;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

const WRITERS: usize = 4;
const TRACES_PER_WRITER: u64 = 50;

fn writer_trace(writer: usize, n: u64) -> Vec<u8> {
    trace_id(writer as u64 * 1_000 + n + 1)
}

#[test]
fn concurrent_pushes_and_cuts_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    let instance = store.instance("acme").unwrap();
    let barrier = Arc::new(Barrier::new(WRITERS + 1));
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for n in 0..TRACES_PER_WRITER {
                    let id = writer_trace(w, n);
                    store.push("acme", &id, &root_fragment("api", "root")).unwrap();
                    store
                        .push("acme", &id, &fragment(&[SpanSpec::child("db", 2, 1, "q")]))
                        .unwrap();
                }
            })
        })
        .collect();

    let cutter = {
        let instance = Arc::clone(&instance);
        let barrier = Arc::clone(&barrier);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            barrier.wait();
            let mut rng = rand::thread_rng();
            while !done.load(Ordering::Acquire) {
                instance.cut_complete_traces(Duration::ZERO, true).unwrap();
                if rng.gen_bool(0.2) {
                    instance.cut_block_if_ready(0, 0, true).unwrap();
                }
                let (live, counted) = instance.live_counts();
                assert_eq!(live, counted);
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    cutter.join().unwrap();

    for w in 0..WRITERS {
        for n in 0..TRACES_PER_WRITER {
            let trace = store
                .find_trace_by_id("acme", &writer_trace(w, n))
                .unwrap()
                .expect("pushed trace is findable");
            assert_eq!(trace.span_count(), 2);
            assert_eq!(trace.root_span_name, "root");
        }
    }

    let total = WRITERS * TRACES_PER_WRITER as usize;
    let response = store
        .search("acme", &SearchRequest::new().with_limit(total * 2))
        .unwrap();
    assert_eq!(response.traces.len(), total);
}

#[test]
fn searches_run_while_blocks_complete() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    for n in 1..=20 {
        store.push("acme", &trace_id(n), &root_fragment("api", "op")).unwrap();
    }
    let barrier = Arc::new(Barrier::new(3));

    let flusher = {
        let store = Arc::clone(&store);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            store.flush().unwrap();
        })
    };
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..10 {
                    let response = store.search("acme", &SearchRequest::new()).unwrap();
                    assert_eq!(response.traces.len(), 20);
                }
            })
        })
        .collect();

    flusher.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(store.instance("acme").unwrap().completed_block_ids().len(), 1);
}

#[test]
fn concurrent_first_push_opens_one_instance() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u64)
        .map(|n| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.push("acme", &trace_id(n + 1), &root_fragment("api", "op")).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(store.tenants(), vec!["acme".to_string()]);
    assert_eq!(store.instance("acme").unwrap().live_count(), 8);
}
