//! Federated search across an instance's tiers
//!
//! The federator runs one operation over a list of shards with a bounded
//! pool of scoped worker threads. Workers pull the next shard index from a
//! shared counter, so no shard is started after the stop flag is raised
//! (result limit reached, byte budget spent, or context cancelled).
//!
//! Failure policy:
//! - a failing shard is logged and counted; the others continue
//! - the call fails only if every executed shard failed (first error wins)
//! - a cancelled or expired context fails the call after workers drain

use crate::collector::{DistinctStringCollector, DistinctValueCollector, ScopedNameCollector};
use crate::filter::TraceFilter;
use crate::metrics::{MetricsResults, SpanMetricsResponse};
use crate::query::SpanEvaluator;
use crate::request::{
    SearchMetrics, SearchResponse, SearchTagValuesResponse, SearchTagValuesV2Response,
    SearchTagsResponse, TagNamesScope, TagScopeFilter, TagSelector, TagValue,
    TraceSearchMetadata, INTRINSIC_TAGS,
};
use crate::shard::{ScanRequest, ScanStats, SearchShard, ShardKind, TraceView, Visit};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use spanstore_core::{
    Context, Error, Resource, Result, Span, TagEntry, TagScope, Trace, TraceId, TraceSummary,
    SERVICE_NAME_KEY,
};
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, warn};

/// Identity of one span across tiers: trace id, resource fingerprint, span id.
type SpanKey = (TraceId, u64, Vec<u8>);

/// Per-shard outcomes of one federated run.
struct RunOutcome<T> {
    results: Vec<(ShardKind, T)>,
    failed: u64,
    skipped: u64,
}

/// Runs search operations over shards with a bounded worker pool.
#[derive(Debug, Clone)]
pub struct SearchFederator {
    concurrency: usize,
}

impl Default for SearchFederator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl SearchFederator {
    /// Federator with `concurrency` workers (0 is treated as 1).
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    /// Worker pool size.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn run<T, F>(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        stop: &AtomicBool,
        work: F,
    ) -> Result<RunOutcome<T>>
    where
        T: Send,
        F: Fn(&dyn SearchShard) -> Result<T> + Sync,
    {
        ctx.check()?;
        let workers = self.concurrency.min(shards.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let next = &next;
                let work = &work;
                scope.spawn(move || loop {
                    let idx = next.fetch_add(1, Ordering::Relaxed);
                    let Some(shard) = shards.get(idx) else {
                        break;
                    };
                    let outcome = if stop.load(Ordering::Acquire) || ctx.is_done() {
                        None
                    } else {
                        Some(work(shard.as_ref()))
                    };
                    if tx.send((idx, outcome)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let mut outcome = RunOutcome {
            results: Vec::with_capacity(shards.len()),
            failed: 0,
            skipped: 0,
        };
        let mut executed = 0u64;
        let mut first_error: Option<Error> = None;
        for (idx, result) in rx.try_iter() {
            let shard = &shards[idx];
            match result {
                None => outcome.skipped += 1,
                Some(Ok(value)) => {
                    executed += 1;
                    outcome.results.push((shard.kind(), value));
                }
                Some(Err(e)) => {
                    executed += 1;
                    outcome.failed += 1;
                    warn!(
                        shard = %shard.kind(),
                        label = %shard.label(),
                        error = %e,
                        "search shard failed"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        ctx.check()?;
        if let Some(e) = first_error {
            if outcome.failed == executed {
                return Err(e);
            }
        }
        Ok(outcome)
    }

    /// Traces matching `filter`, most recent first, at most `limit`.
    pub fn search(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        filter: &TraceFilter,
        limit: usize,
    ) -> Result<SearchResponse> {
        let limit = limit.max(1);
        let stop = AtomicBool::new(false);
        let found: Mutex<FxHashMap<TraceId, TraceSearchMetadata>> =
            Mutex::new(FxHashMap::default());
        let prefilter = |s: &TraceSummary, t: &[TagEntry]| filter.prefilter(s, t);
        let (start, end) = filter.time_range_nanos();
        let request = ScanRequest::new(&prefilter)
            .with_time_range(start, end)
            .with_bodies(filter.needs_bodies());

        let outcome = self.run(ctx, shards, &stop, |shard| {
            shard.scan(ctx, &request, &mut |view: TraceView| {
                if stop.load(Ordering::Acquire) || ctx.is_done() {
                    return Visit::Stop;
                }
                let Some(hit) = filter.matches(&view.summary, &view.tags, view.body.as_ref())
                else {
                    return Visit::Continue;
                };
                let mut found = found.lock();
                match found.entry(view.summary.trace_id) {
                    Entry::Occupied(mut e) => e.get_mut().merge(hit),
                    Entry::Vacant(e) => {
                        e.insert(hit);
                    }
                }
                if found.len() >= limit {
                    stop.store(true, Ordering::Release);
                    return Visit::Stop;
                }
                Visit::Continue
            })
        })?;

        let mut traces: Vec<TraceSearchMetadata> = found.into_inner().into_values().collect();
        traces.sort_by(|a, b| {
            b.start_time_unix_nano
                .cmp(&a.start_time_unix_nano)
                .then_with(|| a.trace_id.cmp(&b.trace_id))
        });
        traces.truncate(limit);

        let metrics = search_metrics(&outcome);
        debug!(
            results = traces.len(),
            inspected_blocks = metrics.inspected_blocks,
            inspected_traces = metrics.inspected_traces,
            failed_shards = metrics.failed_shards,
            "search complete"
        );
        Ok(SearchResponse { traces, metrics })
    }

    /// Distinct tag names, under a `max_bytes` budget (0 = unlimited).
    pub fn search_tags(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        scope: TagScopeFilter,
        max_bytes: usize,
    ) -> Result<SearchTagsResponse> {
        let intrinsic = TagNamesScope {
            name: "intrinsic".to_string(),
            tags: INTRINSIC_TAGS.iter().map(|t| t.to_string()).collect(),
        };
        if scope == TagScopeFilter::Intrinsic {
            return Ok(SearchTagsResponse {
                scopes: vec![intrinsic],
                exceeded_limit: false,
            });
        }

        let scopes = scope.attribute_scopes();
        let stop = AtomicBool::new(false);
        let collector = Mutex::new(ScopedNameCollector::new(max_bytes));
        self.run(ctx, shards, &stop, |shard| {
            shard.tag_names(ctx, scopes, &mut |tag_scope: TagScope, name: &str| {
                if stop.load(Ordering::Acquire) {
                    return Visit::Stop;
                }
                if !collector.lock().collect((tag_scope, name.to_string())) {
                    stop.store(true, Ordering::Release);
                    return Visit::Stop;
                }
                Visit::Continue
            })
        })?;

        let collector = collector.into_inner();
        let exceeded_limit = collector.exceeded();
        let names = collector.into_sorted();
        let mut response = SearchTagsResponse {
            scopes: scopes
                .iter()
                .map(|s| TagNamesScope {
                    name: s.as_str().to_string(),
                    tags: names
                        .iter()
                        .filter(|(scope, _)| scope == s)
                        .map(|(_, n)| n.clone())
                        .collect(),
                })
                .collect(),
            exceeded_limit,
        };
        if scope == TagScopeFilter::All {
            response.scopes.push(intrinsic);
        }
        Ok(response)
    }

    /// Distinct values of attribute `tag` in any scope.
    pub fn search_tag_values(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        tag: &str,
        max_bytes: usize,
    ) -> Result<SearchTagValuesResponse> {
        let stop = AtomicBool::new(false);
        let collector = Mutex::new(DistinctStringCollector::new(max_bytes));
        let has_tag = |_: &TraceSummary, tags: &[TagEntry]| tags.iter().any(|t| t.key == tag);
        let request = ScanRequest::new(&has_tag);

        self.run(ctx, shards, &stop, |shard| {
            shard.scan(ctx, &request, &mut |view: TraceView| {
                if stop.load(Ordering::Acquire) {
                    return Visit::Stop;
                }
                let mut collector = collector.lock();
                for entry in view.tags.iter().filter(|t| t.key == tag) {
                    if !collector.collect(entry.value.to_string()) {
                        stop.store(true, Ordering::Release);
                        return Visit::Stop;
                    }
                }
                Visit::Continue
            })
        })?;

        let collector = collector.into_inner();
        Ok(SearchTagValuesResponse {
            exceeded_limit: collector.exceeded(),
            values: collector.into_sorted(),
        })
    }

    /// Distinct typed values of `selector`, optionally restricted to spans
    /// matching `evaluator`.
    pub fn search_tag_values_v2(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        selector: &TagSelector,
        evaluator: Option<&Arc<dyn SpanEvaluator>>,
        max_bytes: usize,
    ) -> Result<SearchTagValuesV2Response> {
        let stop = AtomicBool::new(false);
        let collector = Mutex::new(DistinctValueCollector::new(max_bytes));
        let need_bodies = evaluator.is_some() || selector.needs_bodies();
        let prefilter = |_: &TraceSummary, tags: &[TagEntry]| match selector {
            TagSelector::Attribute { scope, key } => tags
                .iter()
                .any(|t| t.key == *key && scope.map_or(true, |s| s == t.scope)),
            _ => true,
        };
        let request = ScanRequest::new(&prefilter).with_bodies(need_bodies);

        self.run(ctx, shards, &stop, |shard| {
            shard.scan(ctx, &request, &mut |view: TraceView| {
                if stop.load(Ordering::Acquire) {
                    return Visit::Stop;
                }
                let values = typed_values(selector, evaluator, &view);
                let mut collector = collector.lock();
                for value in values {
                    if !collector.collect(value) {
                        stop.store(true, Ordering::Release);
                        return Visit::Stop;
                    }
                }
                Visit::Continue
            })
        })?;

        let collector = collector.into_inner();
        Ok(SearchTagValuesV2Response {
            exceeded_limit: collector.exceeded(),
            values: collector.into_sorted(),
        })
    }

    /// Duration metrics of matching spans grouped by `group_by`.
    ///
    /// A trace can be split across tiers with different spans in each
    /// partial. Spans are keyed by trace id, resource and span id, so every
    /// span is counted once however many tiers hold a copy of it.
    pub fn span_metrics(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        evaluator: Option<&Arc<dyn SpanEvaluator>>,
        group_by: &str,
        time_range_nanos: (u64, u64),
    ) -> Result<SpanMetricsResponse> {
        let stop = AtomicBool::new(false);
        let seen: Mutex<FxHashSet<SpanKey>> = Mutex::new(FxHashSet::default());
        let (start, end) = time_range_nanos;
        let in_range = |s: &TraceSummary, _: &[TagEntry]| crate::filter::overlaps(s, start, end);
        let request = ScanRequest::new(&in_range)
            .with_time_range(start, end)
            .with_bodies(true);

        let outcome = self.run(ctx, shards, &stop, |shard| {
            let mut results = MetricsResults::new();
            shard.scan(ctx, &request, &mut |view: TraceView| {
                if ctx.is_done() {
                    return Visit::Stop;
                }
                let Some(trace) = view.body.as_ref() else {
                    return Visit::Continue;
                };
                let spans: Vec<(&Resource, &Span)> = match evaluator {
                    Some(e) => e.evaluate(trace),
                    None => trace.spans().collect(),
                };
                let mut seen = seen.lock();
                for (resource, span) in spans {
                    let key = (trace.trace_id, resource.fingerprint(), span.span_id.clone());
                    if seen.insert(key) {
                        results.record_span(group_by, resource, span);
                    }
                }
                Visit::Continue
            })?;
            Ok(results)
        })?;

        let mut combined = MetricsResults::new();
        for (_, results) in &outcome.results {
            combined.combine(results);
        }
        Ok(combined.into_response())
    }

    /// Every shard's partial of trace `id`.
    pub fn find_trace(
        &self,
        ctx: &Context,
        shards: &[Arc<dyn SearchShard>],
        id: &TraceId,
    ) -> Result<Vec<Trace>> {
        let stop = AtomicBool::new(false);
        let outcome = self.run(ctx, shards, &stop, |shard| shard.find_trace(ctx, id))?;
        Ok(outcome
            .results
            .into_iter()
            .filter_map(|(_, partial)| partial)
            .collect())
    }
}

fn search_metrics(outcome: &RunOutcome<ScanStats>) -> SearchMetrics {
    let mut metrics = SearchMetrics {
        failed_shards: outcome.failed,
        skipped_shards: outcome.skipped,
        ..Default::default()
    };
    for (kind, stats) in &outcome.results {
        if kind.is_block() {
            metrics.inspected_blocks += 1;
            metrics.inspected_traces += stats.inspected_traces;
            metrics.inspected_bytes += stats.inspected_bytes;
        }
    }
    metrics
}

fn typed_values(
    selector: &TagSelector,
    evaluator: Option<&Arc<dyn SpanEvaluator>>,
    view: &TraceView,
) -> Vec<TagValue> {
    let body = view.body.as_ref();
    let spans: Option<Vec<(&Resource, &Span)>> = match (evaluator, body) {
        (Some(e), Some(t)) => Some(e.evaluate(t)),
        (None, Some(t)) => Some(t.spans().collect()),
        (Some(_), None) => return Vec::new(),
        (None, None) => None,
    };
    if evaluator.is_some() && spans.as_ref().map_or(true, |s| s.is_empty()) {
        return Vec::new();
    }

    let summary = &view.summary;
    match selector {
        TagSelector::RootServiceName => vec![TagValue::new("string", &summary.root_service_name)],
        TagSelector::RootName => vec![TagValue::new("string", &summary.root_span_name)],
        TagSelector::SpanName | TagSelector::SpanStatus | TagSelector::SpanKind => spans
            .unwrap_or_default()
            .into_iter()
            .map(|(_, span)| match selector {
                TagSelector::SpanName => TagValue::new("string", &span.name),
                TagSelector::SpanStatus => TagValue::new("status", span.status_code.as_str()),
                _ => TagValue::new("kind", span.kind.as_str()),
            })
            .collect(),
        TagSelector::Attribute { scope, key } => match spans {
            Some(spans) if evaluator.is_some() => {
                let mut out = Vec::new();
                for (resource, span) in spans {
                    if scope.map_or(true, |s| s == TagScope::Span) {
                        out.extend(
                            span.attrs
                                .iter()
                                .filter(|a| a.key == *key)
                                .map(|a| TagValue::new(a.value.type_name(), a.value.to_string())),
                        );
                    }
                    if scope.map_or(true, |s| s == TagScope::Resource) {
                        if key == SERVICE_NAME_KEY && !resource.service_name.is_empty() {
                            out.push(TagValue::new("string", &resource.service_name));
                        }
                        out.extend(
                            resource
                                .attrs
                                .iter()
                                .filter(|a| a.key == *key)
                                .map(|a| TagValue::new(a.value.type_name(), a.value.to_string())),
                        );
                    }
                }
                out
            }
            _ => view
                .tags
                .iter()
                .filter(|t| t.key == *key && scope.map_or(true, |s| s == t.scope))
                .map(|t| TagValue::new(t.value.type_name(), t.value.to_string()))
                .collect(),
        },
    }
}
