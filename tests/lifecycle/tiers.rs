//! Visibility of one trace as it moves through the tiers

use crate::common::*;

fn hits(store: &SpanStore, request: &SearchRequest) -> Vec<String> {
    store
        .search("acme", request)
        .unwrap()
        .traces
        .into_iter()
        .map(|t| t.root_trace_name)
        .collect()
}

#[test]
fn trace_is_searchable_in_every_tier() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = trace_id(1);
    store
        .push(
            "acme",
            &id,
            &fragment(&[SpanSpec::root("api", "GET /users").attrs(&[("http.method", "GET")])]),
        )
        .unwrap();
    let request = SearchRequest::new().with_tag("http.method", "GET");
    let instance = store.instance("acme").unwrap();

    // live
    assert_eq!(hits(&store, &request), vec!["GET /users"]);

    // head
    assert_eq!(instance.cut_complete_traces(Duration::ZERO, true).unwrap(), 1);
    assert_eq!(instance.live_count(), 0);
    assert_eq!(hits(&store, &request), vec!["GET /users"]);

    // completing
    let block_id = instance
        .cut_block_if_ready(0, 0, true)
        .unwrap()
        .expect("head was not empty");
    assert_eq!(instance.completing_block_ids(), vec![block_id]);
    assert_eq!(hits(&store, &request), vec!["GET /users"]);

    // completed
    let ctx = Context::background();
    instance.complete_block(&ctx, block_id).unwrap();
    instance.clear_completing_block(block_id).unwrap();
    assert!(instance.completing_block_ids().is_empty());
    assert_eq!(instance.completed_block_ids(), vec![block_id]);
    assert_eq!(hits(&store, &request), vec!["GET /users"]);

    let miss = SearchRequest::new().with_tag("http.method", "POST");
    assert!(hits(&store, &miss).is_empty());
}

#[test]
fn fragments_split_across_tiers_are_combined() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let id = trace_id(7);
    let instance = store.instance("acme").unwrap();

    store.push("acme", &id, &root_fragment("api", "checkout")).unwrap();
    instance.cut_complete_traces(Duration::ZERO, true).unwrap();
    instance.cut_block_if_ready(0, 0, true).unwrap();

    store
        .push("acme", &id, &fragment(&[SpanSpec::child("db", 2, 1, "SELECT")]))
        .unwrap();
    instance.cut_complete_traces(Duration::ZERO, true).unwrap();

    store
        .push("acme", &id, &fragment(&[SpanSpec::child("cache", 3, 1, "GET")]))
        .unwrap();

    let trace = store.find_trace_by_id("acme", &id).unwrap().unwrap();
    assert_eq!(trace.span_count(), 3);
    assert_eq!(trace.root_span_name, "checkout");
    assert_eq!(trace.root_service_name, "api");

    // duplicate delivery of a span is deduplicated
    store.push("acme", &id, &root_fragment("api", "checkout")).unwrap();
    let trace = store.find_trace_by_id("acme", &id).unwrap().unwrap();
    assert_eq!(trace.span_count(), 3);

    let response = store.search("acme", &SearchRequest::new()).unwrap();
    assert_eq!(response.traces.len(), 1);
}

#[test]
fn unknown_trace_is_none() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    assert!(store.find_trace_by_id("acme", &trace_id(2)).unwrap().is_none());
    assert!(store.find_trace_by_id("acme", &[]).unwrap_err().is_validation());
}

#[test]
fn tenants_are_isolated() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    store.push("acme", &trace_id(1), &root_fragment("api", "a")).unwrap();
    store.push("globex", &trace_id(2), &root_fragment("api", "b")).unwrap();

    let acme = store.search("acme", &SearchRequest::new()).unwrap();
    assert_eq!(acme.traces.len(), 1);
    assert_eq!(acme.traces[0].root_trace_name, "a");
    assert!(store.find_trace_by_id("acme", &trace_id(2)).unwrap().is_none());
    assert_eq!(store.tenants(), vec!["acme".to_string(), "globex".to_string()]);
}

#[test]
fn tag_searches_span_the_tiers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let instance = store.instance("acme").unwrap();

    store
        .push(
            "acme",
            &trace_id(1),
            &fragment(&[SpanSpec::root("api", "a").attrs(&[("http.method", "GET")])]),
        )
        .unwrap();
    store.flush().unwrap();
    store
        .push(
            "acme",
            &trace_id(2),
            &fragment(&[SpanSpec::root("web", "b").attrs(&[("http.method", "POST")])]),
        )
        .unwrap();
    assert_eq!(instance.completed_block_ids().len(), 1);

    let values = store.search_tag_values("acme", "http.method").unwrap();
    assert_eq!(values.values, vec!["GET".to_string(), "POST".to_string()]);
    assert!(!values.exceeded_limit);

    let names = store.search_tags("acme", "span").unwrap().all_names();
    assert!(names.contains(&"http.method".to_string()));

    let services = store
        .search_tag_values_v2("acme", "resource.service.name", None)
        .unwrap();
    let rendered: Vec<&str> = services.values.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(rendered, vec!["api", "web"]);
}
