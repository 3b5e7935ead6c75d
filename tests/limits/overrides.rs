//! Live-trace limits and tag query budgets

use crate::common::*;
use spanstore_core::Error;

fn store_with(dir: &TempDir, overrides: StaticOverrides) -> SpanStore {
    SpanStore::builder()
        .config(test_config(dir))
        .overrides(Arc::new(overrides))
        .open()
        .unwrap()
}

#[test]
fn max_live_traces_rejects_new_traces_only() {
    let dir = TempDir::new().unwrap();
    let limits = Limits {
        max_live_traces: 2,
        ..Limits::unlimited()
    };
    let store = store_with(&dir, StaticOverrides::new(limits));

    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.push("acme", &trace_id(2), &root_fragment("api", "b")).unwrap();
    let err = store
        .push("acme", &trace_id(3), &root_fragment("api", "c"))
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));

    // an existing trace still accepts fragments
    store
        .push("acme", &trace_id(1), &fragment(&[SpanSpec::child("db", 2, 1, "q")]))
        .unwrap();

    // cutting frees room
    let instance = store.instance("acme").unwrap();
    instance.cut_complete_traces(Duration::ZERO, true).unwrap();
    store.push("acme", &trace_id(3), &root_fragment("api", "c")).unwrap();
}

#[test]
fn limits_are_per_tenant() {
    let dir = TempDir::new().unwrap();
    let strict = Limits {
        max_bytes_per_trace: 1,
        ..Limits::unlimited()
    };
    let store = store_with(
        &dir,
        StaticOverrides::new(Limits::unlimited()).with_tenant("tiny", strict),
    );

    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    let err = store
        .push("tiny", &trace_id(1), &root_fragment("api", "a"))
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert_eq!(store.instance("tiny").unwrap().live_count(), 0);
}

#[test]
fn tag_values_stop_at_the_byte_budget() {
    let dir = TempDir::new().unwrap();
    let limits = Limits {
        max_bytes_per_tag_values_query: 10,
        ..Limits::unlimited()
    };
    let store = store_with(&dir, StaticOverrides::new(limits));
    let values = ["alpha", "bravo", "charlie", "delta"];
    for (n, value) in values.iter().enumerate() {
        let attrs = [("region", *value)];
        store
            .push(
                "acme",
                &trace_id(n as u64 + 1),
                &fragment(&[SpanSpec::root("api", "op").attrs(&attrs)]),
            )
            .unwrap();
    }

    let response = store.search_tag_values("acme", "region").unwrap();
    assert!(response.exceeded_limit);
    let bytes: usize = response.values.iter().map(String::len).sum();
    assert!(bytes <= 10, "{:?}", response.values);
    assert!(!response.values.is_empty());
}

#[test]
fn block_cap_limits_tag_queries_to_recent_blocks() {
    let dir = TempDir::new().unwrap();
    let limits = Limits {
        max_blocks_per_tag_values_query: 1,
        ..Limits::unlimited()
    };
    let store = store_with(&dir, StaticOverrides::new(limits));
    let instance = store.instance("acme").unwrap();

    store
        .push(
            "acme",
            &trace_id(1),
            &fragment(&[SpanSpec::root("api", "op").attrs(&[("region", "old")])]),
        )
        .unwrap();
    store.flush().unwrap();
    assert_eq!(instance.completed_block_ids().len(), 1);
    store
        .push(
            "acme",
            &trace_id(2),
            &fragment(&[SpanSpec::root("api", "op").attrs(&[("region", "live")])]),
        )
        .unwrap();

    // live is always searched; the single block slot goes to the head
    let response = store.search_tag_values("acme", "region").unwrap();
    assert_eq!(response.values, vec!["live".to_string()]);

    // full searches are not capped
    let hits = store.search("acme", &SearchRequest::new()).unwrap();
    assert_eq!(hits.traces.len(), 2);
}
