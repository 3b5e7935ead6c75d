//! Trace model
//!
//! This is the shape traces take once they leave the live table: resource
//! spans, scope spans and spans, with the trace-level root metadata and the
//! derived nested-set columns filled in by the combiner.
//!
//! Two projections are stored as their own block columns so searches can
//! skip span bodies:
//! - [`TraceSummary`]: id, root names, time bounds
//! - [`TagEntry`]: the distinct (scope, key, value) tags of a trace

use crate::ids::TraceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// Attribute key carrying the service name on a resource.
pub const SERVICE_NAME_KEY: &str = "service.name";

/// Typed attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    /// UTF-8 string
    Str(String),
    /// Signed integer
    Int(i64),
    /// Floating point
    Double(f64),
    /// Boolean
    Bool(bool),
}

impl AttrValue {
    /// Type name reported by typed tag-value searches.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Str(_) => "string",
            AttrValue::Int(_) => "int",
            AttrValue::Double(_) => "float",
            AttrValue::Bool(_) => "bool",
        }
    }

    /// String payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Double(d) => write!(f, "{}", d),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Key/value attribute on a span or resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute key
    pub key: String,
    /// Attribute value
    pub value: AttrValue,
}

impl Attribute {
    /// Create an attribute.
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Emitting resource (usually one service instance)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Value of the `service.name` resource attribute
    pub service_name: String,
    /// All other resource attributes
    pub attrs: Vec<Attribute>,
}

impl Resource {
    /// Stable hash of the resource identity, used to de-duplicate spans
    /// that share a span id across resources.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Xxh3::new();
        h.update(self.service_name.as_bytes());
        for attr in &self.attrs {
            h.update(&[0xff]);
            h.update(attr.key.as_bytes());
            h.update(&[0xfe]);
            h.update(attr.value.to_string().as_bytes());
        }
        h.digest()
    }
}

/// Instrumentation scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    /// Scope name
    pub name: String,
    /// Scope version
    pub version: String,
}

/// Span kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Unspecified
    #[default]
    Unspecified,
    /// Internal operation
    Internal,
    /// Server side of a request
    Server,
    /// Client side of a request
    Client,
    /// Message producer
    Producer,
    /// Message consumer
    Consumer,
}

impl SpanKind {
    /// Name used by the query language.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Unspecified => "unspecified",
            SpanKind::Internal => "internal",
            SpanKind::Server => "server",
            SpanKind::Client => "client",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Span status code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// Not set
    #[default]
    Unset,
    /// Explicitly ok
    Ok,
    /// Error
    Error,
}

impl StatusCode {
    /// Name used by the query language.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unset => "unset",
            StatusCode::Ok => "ok",
            StatusCode::Error => "error",
        }
    }
}

/// One timed operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Span id
    pub span_id: Vec<u8>,
    /// Parent span id, empty for a root span
    pub parent_span_id: Vec<u8>,
    /// Nested-set left bound of the parent, 0 for roots (derived)
    pub parent_id: i32,
    /// Nested-set left bound (derived)
    pub nested_set_left: i32,
    /// Nested-set right bound (derived)
    pub nested_set_right: i32,
    /// Operation name
    pub name: String,
    /// Span kind
    pub kind: SpanKind,
    /// Status
    pub status_code: StatusCode,
    /// Start, unix nanoseconds
    pub start_time_unix_nano: u64,
    /// End, unix nanoseconds
    pub end_time_unix_nano: u64,
    /// Span attributes
    pub attrs: Vec<Attribute>,
}

impl Span {
    /// Span duration in nanoseconds.
    pub fn duration_nano(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }

    /// Whether this span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id.is_empty()
    }
}

/// Spans of one instrumentation scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    /// Scope
    pub scope: Scope,
    /// Spans
    pub spans: Vec<Span>,
}

/// Spans of one resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpans {
    /// Resource
    pub resource: Resource,
    /// Scope spans
    pub scope_spans: Vec<ScopeSpans>,
}

/// A whole (or partial) trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    /// Trace id
    pub trace_id: TraceId,
    /// Service name of the root span
    pub root_service_name: String,
    /// Name of the root span
    pub root_span_name: String,
    /// Earliest span start, unix nanoseconds
    pub start_time_unix_nano: u64,
    /// Latest span end, unix nanoseconds
    pub end_time_unix_nano: u64,
    /// `end - start`
    pub duration_nano: u64,
    /// Resource spans
    pub resource_spans: Vec<ResourceSpans>,
}

impl Trace {
    /// Assemble a trace from one fragment's resource spans, deriving root
    /// metadata and time bounds from the spans.
    pub fn from_resource_spans(trace_id: TraceId, resource_spans: Vec<ResourceSpans>) -> Self {
        let mut trace = Trace {
            trace_id,
            resource_spans,
            ..Default::default()
        };

        let mut start = 0u64;
        let mut end = 0u64;
        let mut root: Option<(String, String)> = None;
        for rs in &trace.resource_spans {
            for ss in &rs.scope_spans {
                for span in &ss.spans {
                    if span.start_time_unix_nano != 0
                        && (start == 0 || span.start_time_unix_nano < start)
                    {
                        start = span.start_time_unix_nano;
                    }
                    end = end.max(span.end_time_unix_nano);
                    if root.is_none() && span.is_root() {
                        root = Some((rs.resource.service_name.clone(), span.name.clone()));
                    }
                }
            }
        }

        if let Some((service, name)) = root {
            trace.root_service_name = service;
            trace.root_span_name = name;
        }
        trace.start_time_unix_nano = start;
        trace.end_time_unix_nano = end;
        trace.duration_nano = end.saturating_sub(start);
        trace
    }

    /// Total number of spans.
    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .map(|ss| ss.spans.len())
            .sum()
    }

    /// Iterate every span together with its resource.
    pub fn spans(&self) -> impl Iterator<Item = (&Resource, &Span)> {
        self.resource_spans.iter().flat_map(|rs| {
            rs.scope_spans
                .iter()
                .flat_map(move |ss| ss.spans.iter().map(move |s| (&rs.resource, s)))
        })
    }

    /// Summary column value.
    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            trace_id: self.trace_id,
            root_service_name: self.root_service_name.clone(),
            root_span_name: self.root_span_name.clone(),
            start_time_unix_nano: self.start_time_unix_nano,
            end_time_unix_nano: self.end_time_unix_nano,
        }
    }

    /// Distinct tags of the trace, resource tags first.
    pub fn tag_entries(&self) -> Vec<TagEntry> {
        let mut out: Vec<TagEntry> = Vec::new();
        let mut push = |entry: TagEntry| {
            if !out.contains(&entry) {
                out.push(entry);
            }
        };
        for rs in &self.resource_spans {
            if !rs.resource.service_name.is_empty() {
                push(TagEntry::new(
                    TagScope::Resource,
                    SERVICE_NAME_KEY,
                    AttrValue::Str(rs.resource.service_name.clone()),
                ));
            }
            for attr in &rs.resource.attrs {
                push(TagEntry::new(
                    TagScope::Resource,
                    attr.key.clone(),
                    attr.value.clone(),
                ));
            }
        }
        for (_, span) in self.spans() {
            for attr in &span.attrs {
                push(TagEntry::new(TagScope::Span, attr.key.clone(), attr.value.clone()));
            }
        }
        out
    }
}

/// Trace-level projection stored in the summary column
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceSummary {
    /// Trace id
    pub trace_id: TraceId,
    /// Root service name
    pub root_service_name: String,
    /// Root span name
    pub root_span_name: String,
    /// Start, unix nanoseconds
    pub start_time_unix_nano: u64,
    /// End, unix nanoseconds
    pub end_time_unix_nano: u64,
}

impl TraceSummary {
    /// `end - start` in nanoseconds.
    pub fn duration_nano(&self) -> u64 {
        self.end_time_unix_nano
            .saturating_sub(self.start_time_unix_nano)
    }
}

/// Where a tag lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TagScope {
    /// Span attribute
    Span,
    /// Resource attribute
    Resource,
}

impl TagScope {
    /// Scope name as used in requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            TagScope::Span => "span",
            TagScope::Resource => "resource",
        }
    }
}

/// One distinct tag of a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEntry {
    /// Scope
    pub scope: TagScope,
    /// Key
    pub key: String,
    /// Value
    pub value: AttrValue,
}

impl TagEntry {
    /// Create a tag entry.
    pub fn new(scope: TagScope, key: impl Into<String>, value: AttrValue) -> Self {
        Self {
            scope,
            key: key.into(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: u8, parent: Option<u8>, name: &str, start: u64, end: u64) -> Span {
        Span {
            span_id: vec![id; 8],
            parent_span_id: parent.map(|p| vec![p; 8]).unwrap_or_default(),
            name: name.to_string(),
            start_time_unix_nano: start,
            end_time_unix_nano: end,
            ..Default::default()
        }
    }

    fn resource_spans(service: &str, spans: Vec<Span>) -> ResourceSpans {
        ResourceSpans {
            resource: Resource {
                service_name: service.to_string(),
                attrs: vec![],
            },
            scope_spans: vec![ScopeSpans {
                scope: Scope::default(),
                spans,
            }],
        }
    }

    #[test]
    fn test_from_resource_spans_derives_root_and_bounds() {
        let id = TraceId::from_slice(&[1; 16]).unwrap();
        let trace = Trace::from_resource_spans(
            id,
            vec![
                resource_spans("child-svc", vec![span(2, Some(1), "child", 15, 30)]),
                resource_spans("root-svc", vec![span(1, None, "root", 10, 20)]),
            ],
        );
        assert_eq!(trace.root_service_name, "root-svc");
        assert_eq!(trace.root_span_name, "root");
        assert_eq!(trace.start_time_unix_nano, 10);
        assert_eq!(trace.end_time_unix_nano, 30);
        assert_eq!(trace.duration_nano, 20);
        assert_eq!(trace.span_count(), 2);
    }

    #[test]
    fn test_tag_entries_are_distinct_and_scoped() {
        let id = TraceId::from_slice(&[1; 16]).unwrap();
        let mut a = span(1, None, "a", 1, 2);
        a.attrs.push(Attribute::new("foo", "bar"));
        let mut b = span(2, Some(1), "b", 1, 2);
        b.attrs.push(Attribute::new("foo", "bar"));
        let trace = Trace::from_resource_spans(id, vec![resource_spans("svc", vec![a, b])]);

        let tags = trace.tag_entries();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].scope, TagScope::Resource);
        assert_eq!(tags[0].key, SERVICE_NAME_KEY);
        assert_eq!(tags[1], TagEntry::new(TagScope::Span, "foo", "bar".into()));
    }

    #[test]
    fn test_resource_fingerprint_distinguishes_attrs() {
        let a = Resource {
            service_name: "svc".into(),
            attrs: vec![Attribute::new("host", "a")],
        };
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.attrs[0].value = "b".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
