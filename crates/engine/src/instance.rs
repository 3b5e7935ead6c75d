//! Per-tenant instance
//!
//! An [`Instance`] owns one tenant's tiers:
//! - the live table and its push log
//! - the current head block
//! - sealed heads waiting to be completed
//! - completed blocks, flushed or not
//!
//! Each tier has its own lock. Lock order is head then completing; the live
//! lock is never held together with another. No lock is held while a block
//! is encoded or searched: searches take a snapshot of every tier (cloned
//! `Arc`s) and run lock-free, which also keeps a cleared block readable
//! until the search holding it is done.

use crate::combiner::{combine_fragments, combine_traces};
use crate::completed::CompletedBlock;
use crate::head::{list_head_files, HeadBlock, HeadShard};
use crate::live::{LiveShard, LiveTraces};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use spanstore_core::{
    decode_fragment, BlockId, Context, Error, IngesterConfig, Overrides, Result, Trace, TraceId,
};
use spanstore_durability::{PushLog, ReplaySummary};
use spanstore_search::{
    QueryCompiler, SearchFederator, SearchRequest, SearchResponse, SearchShard,
    SearchTagValuesResponse, SearchTagValuesV2Response, SearchTagsResponse, ShardKind,
    SpanEvaluator, SpanMetricsRequest, SpanMetricsResponse, TagScopeFilter, TagSelector,
    TraceFilter,
};
use spanstore_storage::{LocalBackend, RangeCache, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// What [`Instance::open`] found on disk.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Completed blocks reopened
    pub completed_blocks: usize,
    /// Of which already flushed
    pub flushed_blocks: usize,
    /// Block directories without a valid meta, removed
    pub removed_block_dirs: usize,
    /// Head files staged as completing
    pub replayed_heads: usize,
    /// Head files deleted because their block was already completed or
    /// they held no records
    pub deleted_heads: usize,
    /// Head files that could not be read at all
    pub unreadable_heads: usize,
    /// Damaged head records skipped
    pub corrupt_head_records: u64,
    /// Push log replay
    pub push_log: ReplaySummary,
    /// Live traces rebuilt from the push log
    pub live_traces: usize,
    /// Time spent in recovery
    pub recovery_time_micros: u64,
}

impl RecoveryReport {
    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        format!(
            "Recovered {} completed blocks ({} flushed), {} completing heads, {} live traces \
             in {}μs",
            self.completed_blocks,
            self.flushed_blocks,
            self.replayed_heads,
            self.live_traces,
            self.recovery_time_micros
        )
    }

    /// Whether anything was skipped or removed.
    pub fn has_issues(&self) -> bool {
        self.removed_block_dirs > 0
            || self.unreadable_heads > 0
            || self.corrupt_head_records > 0
            || self.push_log.has_issues()
    }
}

struct LiveState {
    traces: LiveTraces,
    log: PushLog,
}

/// One tenant's ingest and read state.
pub struct Instance {
    tenant: String,
    config: Arc<IngesterConfig>,
    overrides: Arc<dyn Overrides>,
    compiler: Arc<dyn QueryCompiler>,
    federator: SearchFederator,
    local: Arc<LocalBackend>,
    cache: Option<Arc<RangeCache>>,
    wal_dir: PathBuf,

    live: Mutex<LiveState>,
    live_count: AtomicUsize,
    cut_lock: Mutex<()>,
    head: Mutex<Arc<HeadBlock>>,
    completing: RwLock<Vec<Arc<HeadBlock>>>,
    completing_in_progress: Mutex<FxHashSet<BlockId>>,
    completed: RwLock<Vec<Arc<CompletedBlock>>>,

    recovery: RecoveryReport,
}

impl Instance {
    /// Open the instance of `tenant`, recovering whatever is on disk.
    ///
    /// Recovery:
    /// 1. completed block dirs with a valid meta are reopened, others removed
    /// 2. head files become completing blocks, unless already completed
    /// 3. push log generations are replayed into the live table
    /// 4. the push log is rotated, carrying the live fragments
    /// 5. a fresh head block is created
    pub fn open(
        tenant: &str,
        config: Arc<IngesterConfig>,
        overrides: Arc<dyn Overrides>,
        compiler: Arc<dyn QueryCompiler>,
        cache: Option<Arc<RangeCache>>,
    ) -> Result<Self> {
        let started = Instant::now();
        let ctx = Context::background();
        let mut report = RecoveryReport::default();

        let wal_dir = config.wal_dir().join(tenant);
        fs::create_dir_all(&wal_dir)?;
        let local = Arc::new(LocalBackend::new(config.blocks_dir()));

        let mut completed = Vec::new();
        for block_id in block_dirs(&local.tenant_dir(tenant))? {
            match CompletedBlock::open(
                &ctx,
                Arc::clone(&local),
                cache.clone(),
                config.block.cache_control,
                tenant,
                block_id,
            ) {
                Ok(block) => {
                    report.completed_blocks += 1;
                    if block.flushed_at().is_some() {
                        report.flushed_blocks += 1;
                    }
                    completed.push(Arc::new(block));
                }
                Err(e) if e.is_not_found() || e.is_corruption() => {
                    warn!(tenant, block_id = %block_id, error = %e, "removing incomplete block");
                    local.delete_block(&ctx, tenant, block_id)?;
                    report.removed_block_dirs += 1;
                }
                Err(e) => return Err(e),
            }
        }
        let completed_ids: FxHashSet<BlockId> = completed.iter().map(|b| b.block_id()).collect();

        let mut completing = Vec::new();
        for path in list_head_files(&wal_dir)? {
            let already_completed = head_block_id(&path)
                .map_or(false, |id| completed_ids.contains(&id));
            if already_completed {
                remove_file(&path)?;
                report.deleted_heads += 1;
                continue;
            }
            match HeadBlock::replay(&path, tenant) {
                Ok((head, skipped)) => {
                    report.corrupt_head_records += skipped;
                    if head.is_empty() {
                        remove_file(&path)?;
                        report.deleted_heads += 1;
                    } else {
                        report.replayed_heads += 1;
                        completing.push(Arc::new(head));
                    }
                }
                Err(e) => {
                    warn!(tenant, path = %path.display(), error = %e, "skipping unreadable head");
                    report.unreadable_heads += 1;
                }
            }
        }

        let (mut log, records, push_log) = PushLog::open(&wal_dir, config.wal.sync_mode)?;
        let mut traces = LiveTraces::new();
        for record in records {
            traces.append(record.trace_id, Arc::from(record.payload));
        }
        log.rotate(traces.carry())?;
        report.push_log = push_log;
        report.live_traces = traces.len();

        let head = HeadBlock::create(&wal_dir, tenant, config.wal.sync_mode)?;
        report.recovery_time_micros = started.elapsed().as_micros() as u64;
        if report.has_issues() {
            warn!(tenant, "{}", report.summary());
        } else {
            info!(tenant, "{}", report.summary());
        }

        Ok(Self {
            tenant: tenant.to_string(),
            federator: SearchFederator::new(config.search.concurrency),
            config,
            overrides,
            compiler,
            local,
            cache,
            wal_dir,
            live_count: AtomicUsize::new(traces.len()),
            live: Mutex::new(LiveState { traces, log }),
            cut_lock: Mutex::new(()),
            head: Mutex::new(Arc::new(head)),
            completing: RwLock::new(completing),
            completing_in_progress: Mutex::new(FxHashSet::default()),
            completed: RwLock::new(completed),
            recovery: report,
        })
    }

    // ========================================================================
    // Ingest
    // ========================================================================

    /// Accept one pushed fragment for `trace_id`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if the id or payload is malformed
    /// - [`Error::ResourceExhausted`] if a live-trace limit would be broken
    /// - [`Error::Io`] if the push log append fails
    pub fn push(&self, trace_id: &[u8], payload: &[u8]) -> Result<()> {
        let trace_id = TraceId::from_slice(trace_id)?;
        decode_fragment(payload)?;
        let limits = self.overrides.limits(&self.tenant);

        let mut live = self.live.lock();
        live.traces.check(
            &trace_id,
            payload.len(),
            limits.max_live_traces,
            limits.max_bytes_per_trace,
        )?;
        live.log.append(&trace_id, payload)?;
        live.traces.append(trace_id, Arc::from(payload));
        self.live_count.store(live.traces.len(), Ordering::Release);
        Ok(())
    }

    /// Move live traces idle for at least `idle` (all when `force`) to the
    /// head block. Returns the number of traces cut.
    ///
    /// Traces leave the live table only after the head append is synced,
    /// and fragments pushed while the cut runs stay live. Neither the head
    /// append nor the carried fragments are written under the live lock;
    /// pushes only wait for the live table update and a log file create.
    pub fn cut_complete_traces(&self, idle: Duration, force: bool) -> Result<usize> {
        let _cut = self.cut_lock.lock();
        let candidates = self.live.lock().traces.cut_candidates(idle, force);
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut combined = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            let fragments = candidate.fragments.iter().map(|f| &f[..]);
            match combine_fragments(candidate.trace_id, fragments) {
                Ok(trace) => combined.push(trace),
                Err(e) => warn!(
                    tenant = %self.tenant,
                    trace_id = %candidate.trace_id,
                    error = %e,
                    "dropping undecodable live trace"
                ),
            }
        }

        let head = Arc::clone(&*self.head.lock());
        for trace in &combined {
            head.append(trace)?;
        }
        head.sync()?;

        let (pending, carry, remaining) = {
            let mut live = self.live.lock();
            for candidate in &candidates {
                live.traces.remove_cut(&candidate.trace_id, candidate.fragments.len());
            }
            self.live_count.store(live.traces.len(), Ordering::Release);
            let carry = live.traces.snapshot();
            (live.log.begin_rotate()?, carry, live.traces.len())
        };
        pending.write(
            carry
                .iter()
                .flat_map(|(id, fragments)| fragments.iter().map(move |f| (id, &f[..]))),
        )?;
        debug!(
            tenant = %self.tenant,
            cut = combined.len(),
            remaining,
            "cut live traces"
        );
        Ok(combined.len())
    }

    /// Seal the head and stage it as completing when it is non-empty and
    /// `force` is set or a threshold is reached: `max_bytes`, `max_traces`
    /// (0 disables either) or the tenant's max block duration. Returns the
    /// sealed block's id.
    pub fn cut_block_if_ready(
        &self,
        max_bytes: u64,
        max_traces: usize,
        force: bool,
    ) -> Result<Option<BlockId>> {
        let _cut = self.cut_lock.lock();
        let max_age = self.max_block_duration();
        let current = Arc::clone(&*self.head.lock());
        if current.is_empty() {
            return Ok(None);
        }
        let ready = force
            || (max_bytes > 0 && current.bytes() >= max_bytes)
            || (max_traces > 0 && current.trace_count() >= max_traces)
            || max_age.map_or(false, |age| current.age() >= age);
        if !ready {
            return Ok(None);
        }

        let fresh = HeadBlock::create(&self.wal_dir, &self.tenant, self.config.wal.sync_mode)?;
        let sealed = {
            let mut head = self.head.lock();
            let sealed = std::mem::replace(&mut *head, Arc::new(fresh));
            self.completing.write().push(Arc::clone(&sealed));
            sealed
        };

        sealed.seal()?;
        info!(
            tenant = %self.tenant,
            block_id = %sealed.block_id(),
            traces = sealed.trace_count(),
            bytes = sealed.bytes(),
            "cut head block"
        );
        Ok(Some(sealed.block_id()))
    }

    /// Encode completing block `block_id` as a completed block.
    ///
    /// Completing an already completed block is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the block is neither completing nor completed
    /// - [`Error::InvalidState`] if another caller is completing it
    pub fn complete_block(&self, ctx: &Context, block_id: BlockId) -> Result<()> {
        if self.completed_block(block_id).is_some() {
            return Ok(());
        }
        let head = self
            .completing
            .read()
            .iter()
            .find(|h| h.block_id() == block_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("completing block {}", block_id)))?;
        if !self.completing_in_progress.lock().insert(block_id) {
            return Err(Error::InvalidState(format!(
                "block {} is already being completed",
                block_id
            )));
        }
        let result = self.write_completed(ctx, &head);
        self.completing_in_progress.lock().remove(&block_id);
        let block = result?;

        let mut completed = self.completed.write();
        if !completed.iter().any(|b| b.block_id() == block_id) {
            completed.push(Arc::new(block));
        }
        Ok(())
    }

    fn write_completed(&self, ctx: &Context, head: &HeadBlock) -> Result<CompletedBlock> {
        let started = Instant::now();
        let mut traces = head.read_all(ctx)?;
        traces.sort_by(|a, b| a.trace_id.cmp(&b.trace_id));
        let block = CompletedBlock::write(
            ctx,
            Arc::clone(&self.local),
            self.cache.clone(),
            &self.config.block,
            &self.tenant,
            head.block_id(),
            &traces,
        )?;
        info!(
            tenant = %self.tenant,
            block_id = %head.block_id(),
            traces = traces.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "completed block"
        );
        Ok(block)
    }

    /// Drop completing block `block_id` and delete its head file.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the block is not completing
    /// - [`Error::InvalidState`] if it has not been completed yet
    pub fn clear_completing_block(&self, block_id: BlockId) -> Result<()> {
        if !self.completing.read().iter().any(|h| h.block_id() == block_id) {
            return Err(Error::NotFound(format!("completing block {}", block_id)));
        }
        if self.completed_block(block_id).is_none() {
            return Err(Error::InvalidState(format!(
                "block {} is not completed yet",
                block_id
            )));
        }
        let removed = {
            let mut completing = self.completing.write();
            completing
                .iter()
                .position(|h| h.block_id() == block_id)
                .map(|i| completing.remove(i))
        };
        if let Some(head) = removed {
            head.delete()?;
            info!(tenant = %self.tenant, block_id = %block_id, "cleared completing block");
        }
        Ok(())
    }

    /// Completed block `block_id` if it still needs flushing.
    pub fn get_block_to_be_flushed(&self, block_id: BlockId) -> Option<Arc<CompletedBlock>> {
        self.completed_block(block_id)
            .filter(|b| b.flushed_at().is_none())
    }

    /// Every completed block that still needs flushing.
    pub fn blocks_to_flush(&self) -> Vec<Arc<CompletedBlock>> {
        self.completed
            .read()
            .iter()
            .filter(|b| b.flushed_at().is_none())
            .cloned()
            .collect()
    }

    /// Remove the local state of blocks flushed at least `grace` ago.
    /// Unflushed blocks are never removed. Returns the number cleared.
    pub fn clear_flushed_blocks(&self, ctx: &Context, grace: Duration) -> Result<usize> {
        let now = Utc::now();
        let cleared: Vec<Arc<CompletedBlock>> = {
            let mut completed = self.completed.write();
            let (cleared, kept): (Vec<_>, Vec<_>) = completed
                .drain(..)
                .partition(|b| b.flushed_before(now, grace));
            *completed = kept;
            cleared
        };
        for block in &cleared {
            if let Err(e) = block.delete(ctx) {
                warn!(
                    tenant = %self.tenant,
                    block_id = %block.block_id(),
                    error = %e,
                    "failed to delete flushed block"
                );
            } else {
                info!(tenant = %self.tenant, block_id = %block.block_id(), "cleared flushed block");
            }
        }
        Ok(cleared.len())
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Snapshot of every tier as search shards: live, head, completing,
    /// completed. `max_blocks` caps the block shards (0 = all).
    pub fn shards(&self, max_blocks: usize) -> Vec<Arc<dyn SearchShard>> {
        let live = LiveShard::new(self.live.lock().traces.snapshot());
        let head = self.head.lock().clone();
        let completing = self.completing.read().clone();
        let completed = self.completed.read().clone();

        let mut blocks: Vec<Arc<dyn SearchShard>> = Vec::new();
        blocks.push(Arc::new(HeadShard::new(head, ShardKind::Head)));
        blocks.extend(completing.into_iter().map(|h| {
            Arc::new(HeadShard::new(h, ShardKind::Completing)) as Arc<dyn SearchShard>
        }));
        blocks.extend(completed.into_iter().map(|b| b as Arc<dyn SearchShard>));
        if max_blocks > 0 {
            blocks.truncate(max_blocks);
        }

        let mut shards: Vec<Arc<dyn SearchShard>> = Vec::with_capacity(blocks.len() + 1);
        shards.push(Arc::new(live));
        shards.extend(blocks);
        shards
    }

    /// Traces matching `request`.
    pub fn search(&self, ctx: &Context, request: &SearchRequest) -> Result<SearchResponse> {
        let mut request = request.clone();
        if request.limit == 0 {
            request.limit = self.config.search.default_limit;
        }
        if request.spans_per_span_set == 0 {
            request.spans_per_span_set = self.config.search.default_spans_per_span_set;
        }
        let filter = TraceFilter::new(&request, self.compiler.as_ref())?;
        let shards = self.shards(0);
        self.federator
            .search(ctx, &shards, &filter, request.effective_limit())
    }

    /// Distinct tag names in `scope` (`""`, `none`, `span`, `resource` or
    /// `intrinsic`).
    pub fn search_tags(&self, ctx: &Context, scope: &str) -> Result<SearchTagsResponse> {
        let scope = TagScopeFilter::parse(scope)?;
        let (max_bytes, max_blocks) = self.tag_query_limits();
        let shards = self.shards(max_blocks);
        self.federator.search_tags(ctx, &shards, scope, max_bytes)
    }

    /// Distinct values of attribute `tag`.
    pub fn search_tag_values(&self, ctx: &Context, tag: &str) -> Result<SearchTagValuesResponse> {
        let (max_bytes, max_blocks) = self.tag_query_limits();
        let shards = self.shards(max_blocks);
        self.federator
            .search_tag_values(ctx, &shards, tag, max_bytes)
    }

    /// Distinct typed values of a scoped or intrinsic `tag`, optionally
    /// restricted to spans matching `query`.
    pub fn search_tag_values_v2(
        &self,
        ctx: &Context,
        tag: &str,
        query: Option<&str>,
    ) -> Result<SearchTagValuesV2Response> {
        let selector = TagSelector::parse(tag)?;
        let evaluator = self.compile(query)?;
        let (max_bytes, max_blocks) = self.tag_query_limits();
        let shards = self.shards(max_blocks);
        self.federator
            .search_tag_values_v2(ctx, &shards, &selector, evaluator.as_ref(), max_bytes)
    }

    /// Duration metrics of spans matching the request's query.
    pub fn span_metrics(
        &self,
        ctx: &Context,
        request: &SpanMetricsRequest,
    ) -> Result<SpanMetricsResponse> {
        let evaluator = self.compile(request.query.as_deref())?;
        let range = (
            request.start.saturating_mul(NANOS_PER_SEC),
            request.end.saturating_mul(NANOS_PER_SEC),
        );
        let shards = self.shards(0);
        self.federator
            .span_metrics(ctx, &shards, evaluator.as_ref(), &request.group_by, range)
    }

    /// Trace `trace_id` combined from every tier holding a part of it.
    pub fn find_trace_by_id(&self, ctx: &Context, trace_id: &[u8]) -> Result<Option<Trace>> {
        let trace_id = TraceId::from_slice(trace_id)?;
        let shards = self.shards(0);
        let partials = self.federator.find_trace(ctx, &shards, &trace_id)?;
        Ok(combine_traces(partials))
    }

    fn compile(&self, query: Option<&str>) -> Result<Option<Arc<dyn SpanEvaluator>>> {
        match query.map(str::trim).filter(|q| !q.is_empty()) {
            Some(q) => Ok(Some(self.compiler.compile(q)?)),
            None => Ok(None),
        }
    }

    fn tag_query_limits(&self) -> (usize, usize) {
        let limits = self.overrides.limits(&self.tenant);
        (
            limits.max_bytes_per_tag_values_query,
            limits.max_blocks_per_tag_values_query,
        )
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Tenant id.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Live trace count, updated on every live-table change.
    pub fn live_count(&self) -> usize {
        self.live_count.load(Ordering::Acquire)
    }

    /// Live trace count read under the live lock, with the published count
    /// read under the same lock.
    pub fn live_counts(&self) -> (usize, usize) {
        let live = self.live.lock();
        (live.traces.len(), self.live_count.load(Ordering::Acquire))
    }

    /// Current push log generation.
    pub fn push_log_generation(&self) -> u64 {
        self.live.lock().log.generation()
    }

    /// Id of the current head block.
    pub fn head_block_id(&self) -> BlockId {
        self.head.lock().block_id()
    }

    /// Ids of completing blocks, oldest first.
    pub fn completing_block_ids(&self) -> Vec<BlockId> {
        self.completing.read().iter().map(|h| h.block_id()).collect()
    }

    /// Ids of completed blocks, oldest first.
    pub fn completed_block_ids(&self) -> Vec<BlockId> {
        self.completed.read().iter().map(|b| b.block_id()).collect()
    }

    /// Completed block `block_id`.
    pub fn completed_block(&self, block_id: BlockId) -> Option<Arc<CompletedBlock>> {
        self.completed
            .read()
            .iter()
            .find(|b| b.block_id() == block_id)
            .cloned()
    }

    /// What recovery found when the instance was opened.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Max head age before a cut: the tenant override, else the config.
    pub fn max_block_duration(&self) -> Option<Duration> {
        self.overrides
            .max_block_duration(&self.tenant)
            .or_else(|| {
                (self.config.max_block_duration_ms > 0).then(|| self.config.max_block_duration())
            })
    }

    /// Max head size before a cut: the tenant override, else the config.
    pub fn max_block_bytes(&self) -> u64 {
        match self.overrides.max_block_bytes(&self.tenant) {
            0 => self.config.max_block_bytes,
            bytes => bytes,
        }
    }

    /// Local backend holding completed blocks.
    pub fn local_backend(&self) -> &Arc<LocalBackend> {
        &self.local
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("tenant", &self.tenant)
            .field("live_count", &self.live_count())
            .finish()
    }
}

/// Block ids of the directories under `tenant_dir`.
fn block_dirs(tenant_dir: &Path) -> Result<Vec<BlockId>> {
    let entries = match fs::read_dir(tenant_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(|n| BlockId::parse(n).ok()) {
            ids.push(id);
        }
    }
    ids.sort();
    Ok(ids)
}

fn head_block_id(path: &Path) -> Option<BlockId> {
    path.file_stem()?.to_str().and_then(|s| BlockId::parse(s).ok())
}

fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}
