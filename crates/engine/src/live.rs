//! Live trace table
//!
//! Buffers the raw pushed fragments of every trace that has not been cut to
//! the head block yet. The table itself is not synchronised; the owning
//! instance guards it together with the push log so a fragment is in the
//! log before it is visible here.

use crate::combiner::combine_fragments;
use rustc_hash::FxHashMap;
use spanstore_core::{Context, Error, Result, Trace, TraceId};
use spanstore_search::{ScanRequest, ScanStats, SearchShard, ShardKind, TraceView, Visit};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Fragments of one live trace, in push order.
#[derive(Debug, Clone)]
pub struct LiveTrace {
    fragments: Vec<Arc<[u8]>>,
    last_append: Instant,
    bytes: usize,
}

impl LiveTrace {
    fn new() -> Self {
        Self {
            fragments: Vec::new(),
            last_append: Instant::now(),
            bytes: 0,
        }
    }

    /// Accumulated fragment bytes.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Fragments pushed so far.
    pub fn fragments(&self) -> &[Arc<[u8]>] {
        &self.fragments
    }

    /// Time since the last push.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_append)
    }
}

/// A trace selected for cutting, captured under the live lock.
#[derive(Debug, Clone)]
pub struct CutCandidate {
    /// Trace id
    pub trace_id: TraceId,
    /// Fragments captured. Later pushes are not part of the cut.
    pub fragments: Vec<Arc<[u8]>>,
}

/// Table of live traces.
#[derive(Debug, Default)]
pub struct LiveTraces {
    traces: FxHashMap<TraceId, LiveTrace>,
}

impl LiveTraces {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a push of `len` bytes for `trace_id` that would break a limit.
    /// A limit of 0 is disabled.
    pub fn check(
        &self,
        trace_id: &TraceId,
        len: usize,
        max_live_traces: usize,
        max_bytes_per_trace: usize,
    ) -> Result<()> {
        let current = self.traces.get(trace_id);
        if current.is_none() && max_live_traces > 0 && self.traces.len() >= max_live_traces {
            return Err(Error::ResourceExhausted(format!(
                "max live traces ({}) reached",
                max_live_traces
            )));
        }
        let bytes = current.map_or(0, LiveTrace::bytes) + len;
        if max_bytes_per_trace > 0 && bytes > max_bytes_per_trace {
            return Err(Error::ResourceExhausted(format!(
                "trace {} would be {} bytes, max {}",
                trace_id, bytes, max_bytes_per_trace
            )));
        }
        Ok(())
    }

    /// Append a fragment, creating the entry on first push.
    pub fn append(&mut self, trace_id: TraceId, fragment: Arc<[u8]>) {
        let entry = self.traces.entry(trace_id).or_insert_with(LiveTrace::new);
        entry.bytes += fragment.len();
        entry.fragments.push(fragment);
        entry.last_append = Instant::now();
    }

    /// Traces idle for at least `idle`, or every trace when `force` is set.
    pub fn cut_candidates(&self, idle: Duration, force: bool) -> Vec<CutCandidate> {
        let now = Instant::now();
        self.traces
            .iter()
            .filter(|(_, t)| force || t.idle(now) >= idle)
            .map(|(id, t)| CutCandidate {
                trace_id: *id,
                fragments: t.fragments.clone(),
            })
            .collect()
    }

    /// Drop the first `cut` fragments of `trace_id`. The entry is removed
    /// once empty; fragments pushed after the snapshot stay live.
    pub fn remove_cut(&mut self, trace_id: &TraceId, cut: usize) {
        let Some(entry) = self.traces.get_mut(trace_id) else {
            return;
        };
        let cut = cut.min(entry.fragments.len());
        let removed: usize = entry.fragments.drain(..cut).map(|f| f.len()).sum();
        entry.bytes = entry.bytes.saturating_sub(removed);
        if entry.fragments.is_empty() {
            self.traces.remove(trace_id);
        }
    }

    /// Every buffered fragment, per-trace push order preserved.
    pub fn carry(&self) -> impl Iterator<Item = (&TraceId, &[u8])> {
        self.traces
            .iter()
            .flat_map(|(id, t)| t.fragments.iter().map(move |f| (id, &f[..])))
    }

    /// Copy of the table for a search.
    pub fn snapshot(&self) -> Vec<(TraceId, Vec<Arc<[u8]>>)> {
        self.traces
            .iter()
            .map(|(id, t)| (*id, t.fragments.clone()))
            .collect()
    }

    /// Entry of `trace_id`.
    pub fn get(&self, trace_id: &TraceId) -> Option<&LiveTrace> {
        self.traces.get(trace_id)
    }

    /// Number of live traces.
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }
}

/// Search shard over a snapshot of the live table.
pub struct LiveShard {
    traces: Vec<(TraceId, Vec<Arc<[u8]>>)>,
}

impl LiveShard {
    /// Shard over `snapshot`.
    pub fn new(snapshot: Vec<(TraceId, Vec<Arc<[u8]>>)>) -> Self {
        Self { traces: snapshot }
    }

    fn combine(&self, trace_id: TraceId, fragments: &[Arc<[u8]>]) -> Option<Trace> {
        match combine_fragments(trace_id, fragments.iter().map(|f| &f[..])) {
            Ok(trace) => Some(trace),
            Err(e) => {
                warn!(trace_id = %trace_id, error = %e, "skipping undecodable live trace");
                None
            }
        }
    }
}

impl SearchShard for LiveShard {
    fn kind(&self) -> ShardKind {
        ShardKind::Live
    }

    fn label(&self) -> String {
        "live".to_string()
    }

    fn scan(
        &self,
        ctx: &Context,
        request: &ScanRequest<'_>,
        visit: &mut dyn FnMut(TraceView) -> Visit,
    ) -> Result<ScanStats> {
        let mut stats = ScanStats::default();
        for (trace_id, fragments) in &self.traces {
            ctx.check()?;
            let Some(trace) = self.combine(*trace_id, fragments) else {
                continue;
            };
            stats.inspected_traces += 1;
            stats.inspected_bytes += fragments.iter().map(|f| f.len() as u64).sum::<u64>();
            let view = TraceView::from_trace(trace, request.need_bodies);
            if !(request.prefilter)(&view.summary, &view.tags) {
                continue;
            }
            if visit(view) == Visit::Stop {
                break;
            }
        }
        Ok(stats)
    }

    fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>> {
        ctx.check()?;
        Ok(self
            .traces
            .iter()
            .find(|(trace_id, _)| trace_id == id)
            .and_then(|(trace_id, fragments)| self.combine(*trace_id, fragments)))
    }
}
