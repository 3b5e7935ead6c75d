//! Shared helpers for the integration test groups.

#![allow(dead_code)]

pub use spanstore::prelude::*;
pub use spanstore_core::Context;
pub use std::sync::Arc;
pub use std::time::Duration;
pub use tempfile::TempDir;

/// Config rooted at `dir` for fast, deterministic tests: no fsync, every
/// live trace is immediately cuttable, flushed blocks are cleared at once.
pub fn test_config(dir: &TempDir) -> IngesterConfig {
    let mut config = IngesterConfig::with_data_dir(dir.path());
    config.wal.sync_mode = SyncMode::NoSync;
    config.flush_check_period_ms = 10;
    config.max_trace_idle_ms = 0;
    config.flush_grace_period_ms = 0;
    config
}

/// Route engine logs to the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Store over [`test_config`].
pub fn open_store(dir: &TempDir) -> SpanStore {
    init_tracing();
    SpanStore::builder()
        .config(test_config(dir))
        .open()
        .expect("open store")
}

/// 16-byte trace id ending in `n`.
pub fn trace_id(n: u64) -> Vec<u8> {
    let mut id = vec![0u8; 8];
    id.extend_from_slice(&n.to_be_bytes());
    id
}

/// Parameters of one test span.
pub struct SpanSpec<'a> {
    pub service: &'a str,
    pub span_id: u8,
    pub parent: Option<u8>,
    pub name: &'a str,
    pub start: u64,
    pub end: u64,
    pub attrs: &'a [(&'a str, &'a str)],
}

impl<'a> SpanSpec<'a> {
    pub fn root(service: &'a str, name: &'a str) -> Self {
        Self {
            service,
            span_id: 1,
            parent: None,
            name,
            start: 1_000_000_000,
            end: 2_000_000_000,
            attrs: &[],
        }
    }

    pub fn child(service: &'a str, span_id: u8, parent: u8, name: &'a str) -> Self {
        Self {
            span_id,
            parent: Some(parent),
            start: 1_200_000_000,
            end: 1_500_000_000,
            ..Self::root(service, name)
        }
    }

    pub fn attrs(mut self, attrs: &'a [(&'a str, &'a str)]) -> Self {
        self.attrs = attrs;
        self
    }
}

/// Encoded fragment holding `specs`, one resource per span.
pub fn fragment(specs: &[SpanSpec<'_>]) -> Vec<u8> {
    let resource_spans: Vec<ResourceSpans> = specs
        .iter()
        .map(|s| ResourceSpans {
            resource: Resource {
                service_name: s.service.to_string(),
                attrs: vec![],
            },
            scope_spans: vec![ScopeSpans {
                spans: vec![Span {
                    span_id: vec![s.span_id; 8],
                    parent_span_id: s.parent.map(|p| vec![p; 8]).unwrap_or_default(),
                    name: s.name.to_string(),
                    start_time_unix_nano: s.start,
                    end_time_unix_nano: s.end,
                    attrs: s.attrs.iter().map(|(k, v)| Attribute::new(*k, *v)).collect(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
        .collect();
    encode_fragment(&resource_spans).expect("encode fragment")
}

/// Fragment with a single root span.
pub fn root_fragment(service: &str, name: &str) -> Vec<u8> {
    fragment(&[SpanSpec::root(service, name)])
}
