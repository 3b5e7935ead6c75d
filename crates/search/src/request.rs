//! Search request and response types

use serde::{Deserialize, Serialize};
use spanstore_core::config::{DEFAULT_SEARCH_LIMIT, DEFAULT_SPANS_PER_SPAN_SET};
use spanstore_core::{Attribute, Error, Result, TagScope, TraceSummary};
use std::collections::BTreeMap;

/// Names answered by an `intrinsic` tag-names search. No I/O is needed.
pub const INTRINSIC_TAGS: [&str; 7] = [
    "duration",
    "kind",
    "name",
    "status",
    "traceDuration",
    "rootServiceName",
    "rootName",
];

/// Trace search
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Every key must be present with this value somewhere in the trace
    pub tags: BTreeMap<String, String>,
    /// Optional query compiled by the tenant's query compiler
    pub query: Option<String>,
    /// Max results (0 = default)
    pub limit: usize,
    /// Range start, unix seconds (0 = unbounded)
    pub start: u64,
    /// Range end, unix seconds (0 = unbounded)
    pub end: u64,
    /// Minimum trace duration (0 = none)
    pub min_duration_ms: u64,
    /// Maximum trace duration (0 = none)
    pub max_duration_ms: u64,
    /// Matching spans returned per trace (0 = default)
    pub spans_per_span_set: usize,
}

impl SearchRequest {
    /// Empty request: matches every trace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Filter with a query.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Set the result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Restrict to traces overlapping `[start, end]` unix seconds.
    pub fn with_time_range(mut self, start: u64, end: u64) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// Restrict trace duration.
    pub fn with_duration_ms(mut self, min: u64, max: u64) -> Self {
        self.min_duration_ms = min;
        self.max_duration_ms = max;
        self
    }

    /// Limit with the default applied.
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            self.limit
        }
    }

    /// Spans per span set with the default applied.
    pub fn effective_spans_per_span_set(&self) -> usize {
        if self.spans_per_span_set == 0 {
            DEFAULT_SPANS_PER_SPAN_SET
        } else {
            self.spans_per_span_set
        }
    }

    /// Query text, ignoring blank strings.
    pub fn query_text(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// One matching span in a span set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanSummary {
    /// Hex span id
    pub span_id: String,
    /// Span name
    pub name: String,
    /// Start, unix nanoseconds
    pub start_time_unix_nano: u64,
    /// Duration in nanoseconds
    pub duration_nanos: u64,
    /// Span attributes
    pub attributes: Vec<Attribute>,
}

/// Spans of a trace that matched the query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanSet {
    /// Up to `spans_per_span_set` matching spans
    pub spans: Vec<SpanSummary>,
    /// Total matching spans
    pub matched: u32,
}

/// One search hit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSearchMetadata {
    /// Hex trace id
    pub trace_id: String,
    /// Root service name
    pub root_service_name: String,
    /// Root span name
    pub root_trace_name: String,
    /// Start, unix nanoseconds
    pub start_time_unix_nano: u64,
    /// Trace duration in milliseconds
    pub duration_ms: u32,
    /// Matching spans, when a query was given
    pub span_sets: Vec<SpanSet>,
}

impl TraceSearchMetadata {
    /// Hit built from a trace summary.
    pub fn from_summary(summary: &TraceSummary) -> Self {
        Self {
            trace_id: summary.trace_id.to_hex(),
            root_service_name: summary.root_service_name.clone(),
            root_trace_name: summary.root_span_name.clone(),
            start_time_unix_nano: summary.start_time_unix_nano,
            duration_ms: (summary.duration_nano() / 1_000_000) as u32,
            span_sets: Vec::new(),
        }
    }

    /// Fold another tier's hit for the same trace into this one.
    pub fn merge(&mut self, other: TraceSearchMetadata) {
        let end = (self.start_time_unix_nano + self.duration_ms as u64 * 1_000_000)
            .max(other.start_time_unix_nano + other.duration_ms as u64 * 1_000_000);
        if other.start_time_unix_nano != 0
            && (self.start_time_unix_nano == 0
                || other.start_time_unix_nano < self.start_time_unix_nano)
        {
            self.start_time_unix_nano = other.start_time_unix_nano;
        }
        self.duration_ms = ((end - self.start_time_unix_nano) / 1_000_000) as u32;
        if self.root_service_name.is_empty() {
            self.root_service_name = other.root_service_name;
        }
        if self.root_trace_name.is_empty() {
            self.root_trace_name = other.root_trace_name;
        }
        if self.span_sets.is_empty() {
            self.span_sets = other.span_sets;
        }
    }
}

/// Work done by a search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMetrics {
    /// Traces examined in block tiers
    pub inspected_traces: u64,
    /// Bytes read from block tiers
    pub inspected_bytes: u64,
    /// Block shards searched
    pub inspected_blocks: u64,
    /// Shards that failed
    pub failed_shards: u64,
    /// Shards skipped after the limit was reached
    pub skipped_shards: u64,
}

/// Search results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Hits, most recent first
    pub traces: Vec<TraceSearchMetadata>,
    /// Work done
    pub metrics: SearchMetrics,
}

/// Scope selector of a tag-names search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScopeFilter {
    /// Span and resource scopes
    All,
    /// Span attributes
    Span,
    /// Resource attributes
    Resource,
    /// The static intrinsic vocabulary
    Intrinsic,
}

impl TagScopeFilter {
    /// Parse a request scope.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for anything but `""`, `none`, `span`,
    /// `resource` or `intrinsic`.
    pub fn parse(scope: &str) -> Result<Self> {
        match scope {
            "" | "none" => Ok(TagScopeFilter::All),
            "span" => Ok(TagScopeFilter::Span),
            "resource" => Ok(TagScopeFilter::Resource),
            "intrinsic" => Ok(TagScopeFilter::Intrinsic),
            other => Err(Error::InvalidArgument(format!("unknown tag scope: {}", other))),
        }
    }

    /// Attribute scopes this filter reads.
    pub fn attribute_scopes(&self) -> &'static [TagScope] {
        match self {
            TagScopeFilter::All => &[TagScope::Span, TagScope::Resource],
            TagScopeFilter::Span => &[TagScope::Span],
            TagScopeFilter::Resource => &[TagScope::Resource],
            TagScopeFilter::Intrinsic => &[],
        }
    }
}

/// Tag names by scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagNamesScope {
    /// Scope name
    pub name: String,
    /// Sorted tag names
    pub tags: Vec<String>,
}

/// Tag-names search result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTagsResponse {
    /// One entry per requested scope
    pub scopes: Vec<TagNamesScope>,
    /// The byte budget was hit; results are partial
    pub exceeded_limit: bool,
}

impl SearchTagsResponse {
    /// All names across scopes, sorted and de-duplicated.
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .scopes
            .iter()
            .flat_map(|s| s.tags.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Tag-values search result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTagValuesResponse {
    /// Sorted distinct values
    pub values: Vec<String>,
    /// The byte budget was hit; results are partial
    pub exceeded_limit: bool,
}

/// A typed tag value
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagValue {
    /// `string`, `int`, `float`, `bool`, `duration`, `status` or `kind`
    pub value_type: String,
    /// Rendered value
    pub value: String,
}

impl TagValue {
    /// Create a typed value.
    pub fn new(value_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value_type: value_type.into(),
            value: value.into(),
        }
    }
}

/// Which values a typed tag-values search enumerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSelector {
    /// An attribute; `scope` None means span or resource
    Attribute {
        /// Restrict to one scope
        scope: Option<TagScope>,
        /// Attribute key
        key: String,
    },
    /// Span names
    SpanName,
    /// Span status codes
    SpanStatus,
    /// Span kinds
    SpanKind,
    /// Root service names
    RootServiceName,
    /// Root span names
    RootName,
}

impl TagSelector {
    /// Parse `span.key`, `resource.key`, `.key` or an enumerable intrinsic.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] for bare keys, empty keys, and intrinsics
    /// without a finite value set (`duration`, `traceDuration`).
    pub fn parse(tag: &str) -> Result<Self> {
        let selector = match tag {
            "name" => TagSelector::SpanName,
            "status" => TagSelector::SpanStatus,
            "kind" => TagSelector::SpanKind,
            "rootServiceName" => TagSelector::RootServiceName,
            "rootName" => TagSelector::RootName,
            _ => {
                let (scope, key) = if let Some(k) = tag.strip_prefix("span.") {
                    (Some(TagScope::Span), k)
                } else if let Some(k) = tag.strip_prefix("resource.") {
                    (Some(TagScope::Resource), k)
                } else if let Some(k) = tag.strip_prefix('.') {
                    (None, k)
                } else {
                    return Err(Error::InvalidArgument(format!(
                        "tag must be scoped or an enumerable intrinsic: {}",
                        tag
                    )));
                };
                if key.is_empty() {
                    return Err(Error::InvalidArgument(format!("empty tag name: {}", tag)));
                }
                TagSelector::Attribute {
                    scope,
                    key: key.to_string(),
                }
            }
        };
        Ok(selector)
    }

    /// Whether values come from span bodies.
    pub fn needs_bodies(&self) -> bool {
        matches!(
            self,
            TagSelector::SpanName | TagSelector::SpanStatus | TagSelector::SpanKind
        )
    }
}

/// Typed tag-values search result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchTagValuesV2Response {
    /// Sorted distinct typed values
    pub values: Vec<TagValue>,
    /// The byte budget was hit; results are partial
    pub exceeded_limit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!(TagScopeFilter::parse("").unwrap(), TagScopeFilter::All);
        assert_eq!(TagScopeFilter::parse("none").unwrap(), TagScopeFilter::All);
        assert_eq!(
            TagScopeFilter::parse("intrinsic").unwrap(),
            TagScopeFilter::Intrinsic
        );
        assert!(matches!(
            TagScopeFilter::parse("foo"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tag_selector_parse() {
        assert_eq!(
            TagSelector::parse("span.http.method").unwrap(),
            TagSelector::Attribute {
                scope: Some(TagScope::Span),
                key: "http.method".into()
            }
        );
        assert_eq!(
            TagSelector::parse(".region").unwrap(),
            TagSelector::Attribute {
                scope: None,
                key: "region".into()
            }
        );
        assert!(TagSelector::parse("kind").unwrap().needs_bodies());
        assert!(TagSelector::parse("duration").is_err());
        assert!(TagSelector::parse("resource.").is_err());
    }

    #[test]
    fn test_defaults() {
        let req = SearchRequest::new().with_query("   ");
        assert_eq!(req.effective_limit(), 20);
        assert_eq!(req.effective_spans_per_span_set(), 3);
        assert_eq!(req.query_text(), None);
    }

    #[test]
    fn test_merge_widens_and_fills() {
        let mut a = TraceSearchMetadata {
            trace_id: "01".into(),
            start_time_unix_nano: 2_000_000_000,
            duration_ms: 1000,
            ..Default::default()
        };
        let b = TraceSearchMetadata {
            trace_id: "01".into(),
            root_service_name: "svc".into(),
            start_time_unix_nano: 1_000_000_000,
            duration_ms: 500,
            ..Default::default()
        };
        a.merge(b);
        assert_eq!(a.start_time_unix_nano, 1_000_000_000);
        assert_eq!(a.duration_ms, 2000);
        assert_eq!(a.root_service_name, "svc");
    }
}
