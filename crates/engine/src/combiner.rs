//! Trace combiner
//!
//! Merges partial traces for one trace id, pairwise in arrival order:
//! - root service and span names: first non-empty value wins
//! - start is the minimum non-zero start, end the maximum end
//! - spans are de-duplicated by (resource fingerprint, span id), first kept
//!
//! [`TraceCombiner::result`] then rebuilds the derived columns. Pass one
//! indexes spans by id and collects child lists; pass two walks every tree
//! in pre-order with an explicit stack and numbers nested-set bounds
//! contiguously across trees. A span whose parent is absent starts a new
//! tree. `parent_id` is the parent's left bound, 0 for roots.
//!
//! The root-name policy depends on arrival order. Callers feed partials in
//! the order they were received.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use spanstore_core::{decode_fragment, Result, ScopeSpans, Trace, TraceId};
use xxhash_rust::xxh3::Xxh3;

type Children = SmallVec<[usize; 4]>;

/// Incremental merger of partial traces.
#[derive(Debug, Default)]
pub struct TraceCombiner {
    result: Option<Trace>,
    seen: FxHashSet<u64>,
    consumed: usize,
}

impl TraceCombiner {
    /// Empty combiner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one partial trace. `None` is ignored. Returns the number of
    /// spans it contributed.
    pub fn consume(&mut self, trace: Option<Trace>) -> usize {
        let Some(mut trace) = trace else {
            return 0;
        };
        self.consumed += 1;

        let Some(result) = self.result.as_mut() else {
            let mut added = 0;
            for rs in &trace.resource_spans {
                let fingerprint = rs.resource.fingerprint();
                for span in rs.scope_spans.iter().flat_map(|ss| ss.spans.iter()) {
                    self.seen.insert(span_key(fingerprint, &span.span_id));
                    added += 1;
                }
            }
            self.result = Some(trace);
            return added;
        };

        if result.root_service_name.is_empty() {
            result.root_service_name = std::mem::take(&mut trace.root_service_name);
        }
        if result.root_span_name.is_empty() {
            result.root_span_name = std::mem::take(&mut trace.root_span_name);
        }
        if trace.start_time_unix_nano != 0
            && (result.start_time_unix_nano == 0
                || trace.start_time_unix_nano < result.start_time_unix_nano)
        {
            result.start_time_unix_nano = trace.start_time_unix_nano;
        }
        result.end_time_unix_nano = result.end_time_unix_nano.max(trace.end_time_unix_nano);

        let mut added = 0;
        for mut rs in trace.resource_spans {
            let fingerprint = rs.resource.fingerprint();
            let mut kept: Vec<ScopeSpans> = Vec::new();
            for mut ss in rs.scope_spans.drain(..) {
                ss.spans
                    .retain(|span| self.seen.insert(span_key(fingerprint, &span.span_id)));
                if !ss.spans.is_empty() {
                    added += ss.spans.len();
                    kept.push(ss);
                }
            }
            if !kept.is_empty() {
                rs.scope_spans = kept;
                result.resource_spans.push(rs);
            }
        }
        added
    }

    /// Number of non-`None` partials consumed.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// The merged trace and its span total.
    ///
    /// The total is `None` when fewer than two partials were consumed,
    /// i.e. nothing was actually combined. The trace always has its
    /// duration and nested-set columns rebuilt.
    pub fn result(self) -> (Option<Trace>, Option<usize>) {
        let combined = self.consumed >= 2;
        let Some(mut trace) = self.result else {
            return (None, None);
        };
        trace.duration_nano = trace
            .end_time_unix_nano
            .saturating_sub(trace.start_time_unix_nano);
        assign_nested_set_bounds(&mut trace);
        let total = combined.then(|| trace.span_count());
        (Some(trace), total)
    }
}

/// Combine any number of partials into one trace.
pub fn combine_traces(partials: impl IntoIterator<Item = Trace>) -> Option<Trace> {
    let mut combiner = TraceCombiner::new();
    for partial in partials {
        combiner.consume(Some(partial));
    }
    combiner.result().0
}

/// Combine the raw pushed fragments of one live trace.
///
/// # Errors
///
/// [`spanstore_core::Error::Validation`] if a fragment does not decode.
pub fn combine_fragments<'a>(
    trace_id: TraceId,
    fragments: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Trace> {
    let mut combiner = TraceCombiner::new();
    for fragment in fragments {
        let resource_spans = decode_fragment(fragment)?;
        combiner.consume(Some(Trace::from_resource_spans(trace_id, resource_spans)));
    }
    Ok(combiner.result().0.unwrap_or(Trace {
        trace_id,
        ..Default::default()
    }))
}

fn span_key(resource_fingerprint: u64, span_id: &[u8]) -> u64 {
    let mut h = Xxh3::new();
    h.update(&resource_fingerprint.to_le_bytes());
    h.update(span_id);
    h.digest()
}

/// Rebuild `parent_id` and nested-set bounds for every span.
fn assign_nested_set_bounds(trace: &mut Trace) {
    // (resource, scope, span) position of every span in trace order.
    let mut positions: Vec<(usize, usize, usize)> = Vec::with_capacity(trace.span_count());
    for (r, rs) in trace.resource_spans.iter().enumerate() {
        for (s, ss) in rs.scope_spans.iter().enumerate() {
            positions.extend((0..ss.spans.len()).map(|i| (r, s, i)));
        }
    }
    fn tie_lifetime<F: Fn(&Trace, usize) -> &spanstore_core::Span>(f: F) -> F {
        f
    }
    let span_at = tie_lifetime(|trace: &Trace, idx: usize| {
        let (r, s, i) = positions[idx];
        &trace.resource_spans[r].scope_spans[s].spans[i]
    });

    let mut by_id: FxHashMap<&[u8], usize> = FxHashMap::default();
    for idx in 0..positions.len() {
        let span = span_at(trace, idx);
        if !span.span_id.is_empty() {
            by_id.entry(span.span_id.as_slice()).or_insert(idx);
        }
    }

    let mut children: Vec<Children> = vec![Children::new(); positions.len()];
    let mut roots: Vec<usize> = Vec::new();
    for idx in 0..positions.len() {
        let span = span_at(trace, idx);
        match by_id.get(span.parent_span_id.as_slice()) {
            Some(&parent) if !span.parent_span_id.is_empty() && parent != idx => {
                children[parent].push(idx)
            }
            _ => roots.push(idx),
        }
    }
    drop(by_id);

    let mut bounds: Vec<(i32, i32, i32)> = vec![(0, 0, 0); positions.len()];
    let mut visited = vec![false; positions.len()];
    let mut next = 1i32;
    let mut stack: Vec<(usize, usize)> = Vec::new();
    for root in roots {
        if visited[root] {
            continue;
        }
        visited[root] = true;
        bounds[root] = (0, next, 0);
        next += 1;
        stack.push((root, 0));

        while let Some((idx, cursor)) = stack.last_mut() {
            let idx = *idx;
            if let Some(&child) = children[idx].get(*cursor) {
                *cursor += 1;
                if visited[child] {
                    continue;
                }
                visited[child] = true;
                bounds[child] = (bounds[idx].1, next, 0);
                next += 1;
                stack.push((child, 0));
            } else {
                bounds[idx].2 = next;
                next += 1;
                stack.pop();
            }
        }
    }

    for (idx, &(r, s, i)) in positions.iter().enumerate() {
        let span = &mut trace.resource_spans[r].scope_spans[s].spans[i];
        let (parent_id, left, right) = bounds[idx];
        span.parent_id = parent_id;
        span.nested_set_left = left;
        span.nested_set_right = right;
    }
}
