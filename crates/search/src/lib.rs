//! Federated search for spanstore
//!
//! This crate runs searches over the tiers of one tenant instance:
//! - request: search, tag and tag-value request/response types
//! - query: compiled span evaluator interface and the conjunction compiler
//! - filter: per-request trace predicate over summary, tags and bodies
//! - collector: distinct-value collectors under a byte budget
//! - metrics: log2 latency histogram and grouped span metrics
//! - shard: the `SearchShard` trait every tier implements
//! - federator: bounded concurrent fan-out, merge, limits and failure policy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod federator;
pub mod filter;
pub mod metrics;
pub mod query;
pub mod request;
pub mod shard;

pub use collector::{
    DistinctCollector, DistinctStringCollector, DistinctValueCollector, ScopedNameCollector,
};
pub use federator::SearchFederator;
pub use filter::TraceFilter;
pub use metrics::{
    LatencyHistogram, MetricSeries, MetricsResults, SpanMetricsRequest, SpanMetricsResponse,
    SpanMetricsSummary,
};
pub use query::{ConjunctionCompiler, QueryCompiler, SpanEvaluator};
pub use request::{
    SearchMetrics, SearchRequest, SearchResponse, SearchTagValuesResponse,
    SearchTagValuesV2Response, SearchTagsResponse, SpanSet, SpanSummary, TagNamesScope,
    TagScopeFilter, TagSelector, TagValue, TraceSearchMetadata, INTRINSIC_TAGS,
};
pub use shard::{ScanRequest, ScanStats, SearchShard, ShardKind, TraceView, Visit};
