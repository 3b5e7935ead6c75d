//! Search shard interface
//!
//! Every tier of an instance (live table, head, completing and completed
//! blocks) is exposed to the federator as a [`SearchShard`]. A shard
//! streams [`TraceView`]s to a visitor; the visitor decides what to keep
//! and when to stop.

use spanstore_core::{Context, Result, TagEntry, TagScope, Trace, TraceId, TraceSummary};
use std::fmt;

/// Which tier a shard reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardKind {
    /// In-memory live traces
    Live,
    /// The head block
    Head,
    /// A sealed block waiting to be completed
    Completing,
    /// A completed columnar block
    Completed,
}

impl ShardKind {
    /// Whether the shard is a block, counted in inspected metrics.
    pub fn is_block(&self) -> bool {
        !matches!(self, ShardKind::Live)
    }
}

impl fmt::Display for ShardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardKind::Live => "live",
            ShardKind::Head => "head",
            ShardKind::Completing => "completing",
            ShardKind::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Scan-time prefilter over the summary and tag columns.
pub type Prefilter<'a> = &'a (dyn Fn(&TraceSummary, &[TagEntry]) -> bool + Sync);

/// What a scan should read.
#[derive(Clone, Copy)]
pub struct ScanRequest<'a> {
    /// Range start, unix nanoseconds (0 = unbounded)
    pub start_nanos: u64,
    /// Range end, unix nanoseconds (0 = unbounded)
    pub end_nanos: u64,
    /// Whether visited traces need their bodies
    pub need_bodies: bool,
    /// Traces failing this are skipped before the body is read
    pub prefilter: Prefilter<'a>,
}

impl<'a> ScanRequest<'a> {
    /// Scan everything the prefilter accepts, without bodies.
    pub fn new(prefilter: Prefilter<'a>) -> Self {
        Self {
            start_nanos: 0,
            end_nanos: 0,
            need_bodies: false,
            prefilter,
        }
    }

    /// Restrict to a time range.
    pub fn with_time_range(mut self, start_nanos: u64, end_nanos: u64) -> Self {
        self.start_nanos = start_nanos;
        self.end_nanos = end_nanos;
        self
    }

    /// Read bodies of accepted traces.
    pub fn with_bodies(mut self, need_bodies: bool) -> Self {
        self.need_bodies = need_bodies;
        self
    }
}

/// One trace handed to a visitor.
#[derive(Debug, Clone)]
pub struct TraceView {
    /// Summary column
    pub summary: TraceSummary,
    /// Tag column
    pub tags: Vec<TagEntry>,
    /// Body, when requested
    pub body: Option<Trace>,
}

impl TraceView {
    /// View of a full trace.
    pub fn from_trace(trace: Trace, with_body: bool) -> Self {
        Self {
            summary: trace.summary(),
            tags: trace.tag_entries(),
            body: with_body.then_some(trace),
        }
    }
}

/// Visitor verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Keep scanning
    Continue,
    /// Stop this shard
    Stop,
}

/// Work done by one shard scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Traces examined
    pub inspected_traces: u64,
    /// Bytes read
    pub inspected_bytes: u64,
}

/// A searchable tier.
pub trait SearchShard: Send + Sync {
    /// Tier of this shard.
    fn kind(&self) -> ShardKind;

    /// Short label for logs, e.g. the block id.
    fn label(&self) -> String;

    /// Stream traces accepted by `request.prefilter` to `visit`.
    fn scan(
        &self,
        ctx: &Context,
        request: &ScanRequest<'_>,
        visit: &mut dyn FnMut(TraceView) -> Visit,
    ) -> Result<ScanStats>;

    /// Stream the tag names of `scopes` to `visit`. Names may repeat.
    fn tag_names(
        &self,
        ctx: &Context,
        scopes: &[TagScope],
        visit: &mut dyn FnMut(TagScope, &str) -> Visit,
    ) -> Result<ScanStats> {
        let accept_all = |_: &TraceSummary, _: &[TagEntry]| true;
        let request = ScanRequest::new(&accept_all);
        self.scan(ctx, &request, &mut |view: TraceView| {
            for tag in &view.tags {
                if scopes.contains(&tag.scope) && visit(tag.scope, &tag.key) == Visit::Stop {
                    return Visit::Stop;
                }
            }
            Visit::Continue
        })
    }

    /// The shard's partial of trace `id`, if present.
    fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>>;
}
