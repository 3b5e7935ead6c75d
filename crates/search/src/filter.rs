//! Per-request trace filter
//!
//! A [`TraceFilter`] is built once per search from the request. Shards call
//! [`TraceFilter::prefilter`] with the cheap summary and tag columns, and
//! only fetch the trace body when [`TraceFilter::needs_bodies`] says the
//! final decision depends on it.

use crate::query::{QueryCompiler, SpanEvaluator};
use crate::request::{SearchRequest, SpanSet, SpanSummary, TraceSearchMetadata};
use spanstore_core::{Result, Span, TagEntry, Trace, TraceSummary};
use std::sync::Arc;

/// Tag key matched against span names rather than attributes.
pub const NAME_TAG: &str = "name";

const NANOS_PER_SEC: u64 = 1_000_000_000;
const NANOS_PER_MILLI: u64 = 1_000_000;

/// Compiled search predicate.
pub struct TraceFilter {
    tags: Vec<(String, String)>,
    start_nanos: u64,
    end_nanos: u64,
    min_duration_ms: u64,
    max_duration_ms: u64,
    evaluator: Option<Arc<dyn SpanEvaluator>>,
    spans_per_span_set: usize,
}

impl TraceFilter {
    /// Build the filter for `request`, compiling its query if present.
    pub fn new(request: &SearchRequest, compiler: &dyn QueryCompiler) -> Result<Self> {
        let evaluator = match request.query_text() {
            Some(q) => Some(compiler.compile(q)?),
            None => None,
        };
        Ok(Self {
            tags: request
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            start_nanos: request.start.saturating_mul(NANOS_PER_SEC),
            end_nanos: request.end.saturating_mul(NANOS_PER_SEC),
            min_duration_ms: request.min_duration_ms,
            max_duration_ms: request.max_duration_ms,
            evaluator,
            spans_per_span_set: request.effective_spans_per_span_set(),
        })
    }

    /// Time range in unix nanoseconds, 0 = unbounded.
    pub fn time_range_nanos(&self) -> (u64, u64) {
        (self.start_nanos, self.end_nanos)
    }

    /// Whether the full match needs span bodies.
    pub fn needs_bodies(&self) -> bool {
        self.evaluator.is_some() || self.tags.iter().any(|(k, _)| k == NAME_TAG)
    }

    /// Decision on the summary and tag columns alone. A `true` may still be
    /// rejected by [`TraceFilter::matches`] when bodies are needed.
    pub fn prefilter(&self, summary: &TraceSummary, tags: &[TagEntry]) -> bool {
        if !overlaps(summary, self.start_nanos, self.end_nanos) {
            return false;
        }
        let duration_ms = summary.duration_nano() / NANOS_PER_MILLI;
        if self.min_duration_ms > 0 && duration_ms < self.min_duration_ms {
            return false;
        }
        if self.max_duration_ms > 0 && duration_ms > self.max_duration_ms {
            return false;
        }
        self.tags
            .iter()
            .filter(|(k, _)| k != NAME_TAG)
            .all(|(k, v)| tag_matches(tags, k, v))
    }

    /// Full decision. `body` must be present when [`Self::needs_bodies`].
    pub fn matches(
        &self,
        summary: &TraceSummary,
        tags: &[TagEntry],
        body: Option<&Trace>,
    ) -> Option<TraceSearchMetadata> {
        if !self.prefilter(summary, tags) {
            return None;
        }
        for (k, v) in &self.tags {
            if k == NAME_TAG
                && !tag_matches(tags, k, v)
                && !body.map_or(false, |t| t.spans().any(|(_, s)| s.name == *v))
            {
                return None;
            }
        }

        let mut metadata = TraceSearchMetadata::from_summary(summary);
        if let Some(evaluator) = &self.evaluator {
            let trace = body?;
            let matched = evaluator.evaluate(trace);
            if matched.is_empty() {
                return None;
            }
            metadata.span_sets.push(SpanSet {
                spans: matched
                    .iter()
                    .take(self.spans_per_span_set)
                    .map(|(_, span)| span_summary(span))
                    .collect(),
                matched: matched.len() as u32,
            });
        }
        Some(metadata)
    }
}

/// Whether a trace with `summary` overlaps `[start, end]` nanoseconds.
pub fn overlaps(summary: &TraceSummary, start_nanos: u64, end_nanos: u64) -> bool {
    (start_nanos == 0 || summary.end_time_unix_nano >= start_nanos)
        && (end_nanos == 0 || summary.start_time_unix_nano <= end_nanos)
}

fn tag_matches(tags: &[TagEntry], key: &str, value: &str) -> bool {
    tags.iter()
        .any(|t| t.key == key && t.value.to_string() == value)
}

/// Lowercase hex of a span id.
pub fn span_id_hex(id: &[u8]) -> String {
    id.iter().map(|b| format!("{:02x}", b)).collect()
}

fn span_summary(span: &Span) -> SpanSummary {
    SpanSummary {
        span_id: span_id_hex(&span.span_id),
        name: span.name.clone(),
        start_time_unix_nano: span.start_time_unix_nano,
        duration_nanos: span.duration_nano(),
        attributes: span.attrs.clone(),
    }
}
