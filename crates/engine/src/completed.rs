//! Completed blocks
//!
//! A completed block is a columnar block file plus its meta sidecar under
//! the local blocks directory. Every read opens a fresh reader stack so the
//! bytes counted by its innermost layer belong to that query alone. Once
//! the block has been shipped to the flush backend a `flushed` marker
//! holding the flush time is written next to it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use spanstore_core::{
    BlockConfig, BlockId, CacheControl, Context, Error, Result, TagScope, Trace, TraceId,
};
use spanstore_search::{ScanRequest, ScanStats, SearchShard, ShardKind, TraceView, Visit};
use spanstore_storage::{
    encode_block, open_block_reader, BlockFile, BlockMeta, BlockReaderStack, LocalBackend,
    RangeCache, StorageBackend, DATA_OBJECT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Marker object written once a block is flushed.
pub const FLUSHED_OBJECT: &str = "flushed";

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// A completed columnar block on local disk.
pub struct CompletedBlock {
    meta: BlockMeta,
    local: Arc<LocalBackend>,
    cache: Option<Arc<RangeCache>>,
    cache_control: CacheControl,
    flushed_at: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for CompletedBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedBlock")
            .field("block_id", &self.meta.block_id)
            .field("tenant", &self.meta.tenant)
            .field("flushed_at", &*self.flushed_at.lock())
            .finish()
    }
}

impl CompletedBlock {
    /// Encode `traces` (strictly sorted by id) as block `block_id` and write
    /// it, data first and meta last.
    pub fn write(
        ctx: &Context,
        local: Arc<LocalBackend>,
        cache: Option<Arc<RangeCache>>,
        config: &BlockConfig,
        tenant: &str,
        block_id: BlockId,
        traces: &[Trace],
    ) -> Result<Self> {
        let encoded = encode_block(traces, config.row_group_traces, config.zstd_level)?;
        let meta = encoded.meta(block_id, tenant);
        local.write_block(ctx, &meta, &encoded.data)?;
        info!(
            tenant,
            block_id = %block_id,
            traces = encoded.trace_count,
            row_groups = encoded.row_groups,
            bytes = meta.size,
            "wrote completed block"
        );
        Ok(Self {
            meta,
            local,
            cache,
            cache_control: config.cache_control,
            flushed_at: Mutex::new(None),
        })
    }

    /// Open an existing block, picking up its flush marker.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] or [`Error::Corruption`] if the meta sidecar is
    /// missing or unreadable.
    pub fn open(
        ctx: &Context,
        local: Arc<LocalBackend>,
        cache: Option<Arc<RangeCache>>,
        cache_control: CacheControl,
        tenant: &str,
        block_id: BlockId,
    ) -> Result<Self> {
        let meta = local.read_meta(ctx, tenant, block_id)?;
        let flushed_at = match local.read_all(ctx, tenant, block_id, FLUSHED_OBJECT) {
            Ok(bytes) => Some(parse_marker(&bytes)?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        Ok(Self {
            meta,
            local,
            cache,
            cache_control,
            flushed_at: Mutex::new(flushed_at),
        })
    }

    /// Block meta.
    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// Block id.
    pub fn block_id(&self) -> BlockId {
        self.meta.block_id
    }

    /// Open the block file through a fresh reader stack.
    pub fn open_file(&self, ctx: &Context) -> Result<BlockFile<BlockReaderStack>> {
        let backend: Arc<dyn StorageBackend> = self.local.clone();
        let reader = open_block_reader(backend, self.cache.clone(), &self.meta, self.cache_control);
        BlockFile::open(ctx, reader)
    }

    /// Raw block file bytes, for the flusher.
    pub fn read_data(&self, ctx: &Context) -> Result<Vec<u8>> {
        self.local
            .read_all(ctx, &self.meta.tenant, self.meta.block_id, DATA_OBJECT)
    }

    /// Record that the block was flushed now.
    pub fn mark_flushed(&self, ctx: &Context) -> Result<()> {
        let now = Utc::now();
        self.local.write(
            ctx,
            &self.meta.tenant,
            self.meta.block_id,
            FLUSHED_OBJECT,
            now.to_rfc3339().as_bytes(),
        )?;
        *self.flushed_at.lock() = Some(now);
        debug!(tenant = %self.meta.tenant, block_id = %self.meta.block_id, "marked block flushed");
        Ok(())
    }

    /// When the block was flushed, if it was.
    pub fn flushed_at(&self) -> Option<DateTime<Utc>> {
        *self.flushed_at.lock()
    }

    /// Whether the block was flushed at least `grace` ago.
    pub fn flushed_before(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let Some(at) = self.flushed_at() else {
            return false;
        };
        match now.signed_duration_since(at).to_std() {
            Ok(elapsed) => elapsed >= grace,
            Err(_) => false,
        }
    }

    /// Remove the block's local objects and cached ranges.
    pub fn delete(&self, ctx: &Context) -> Result<()> {
        if let Some(cache) = &self.cache {
            cache.invalidate_block(self.meta.block_id);
        }
        self.local
            .delete_block(ctx, &self.meta.tenant, self.meta.block_id)
    }
}

fn parse_marker(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::Corruption(format!("bad flush marker: {}", e)))?;
    DateTime::parse_from_rfc3339(text.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Corruption(format!("bad flush marker: {}", e)))
}

impl SearchShard for CompletedBlock {
    fn kind(&self) -> ShardKind {
        ShardKind::Completed
    }

    fn label(&self) -> String {
        format!("completed:{}", self.meta.block_id)
    }

    fn scan(
        &self,
        ctx: &Context,
        request: &ScanRequest<'_>,
        visit: &mut dyn FnMut(TraceView) -> Visit,
    ) -> Result<ScanStats> {
        let (start, end) = (request.start_nanos, request.end_nanos);
        if !self
            .meta
            .overlaps_secs(start / NANOS_PER_SEC, end / NANOS_PER_SEC)
        {
            return Ok(ScanStats::default());
        }

        let file = self.open_file(ctx)?;
        let mut stats = ScanStats::default();
        'groups: for (rg, index) in file.row_groups().iter().enumerate() {
            if !index.overlaps(start, end) {
                continue;
            }
            let summaries = file.read_summaries(ctx, rg)?;
            let tags = file.read_tags(ctx, rg)?;
            let mut bodies: Option<Vec<Trace>> = None;
            for (i, (summary, tags)) in summaries.into_iter().zip(tags).enumerate() {
                ctx.check()?;
                stats.inspected_traces += 1;
                if !(request.prefilter)(&summary, &tags) {
                    continue;
                }
                let body = if request.need_bodies {
                    if bodies.is_none() {
                        bodies = Some(file.read_bodies(ctx, rg)?);
                    }
                    bodies.as_mut().and_then(|b| b.get_mut(i)).map(std::mem::take)
                } else {
                    None
                };
                if visit(TraceView {
                    summary,
                    tags,
                    body,
                }) == Visit::Stop
                {
                    break 'groups;
                }
            }
        }
        stats.inspected_bytes = file.bytes_read();
        Ok(stats)
    }

    fn tag_names(
        &self,
        ctx: &Context,
        scopes: &[TagScope],
        visit: &mut dyn FnMut(TagScope, &str) -> Visit,
    ) -> Result<ScanStats> {
        let file = self.open_file(ctx)?;
        'scopes: for scope in scopes {
            for name in file.tag_names(*scope) {
                if visit(*scope, name) == Visit::Stop {
                    break 'scopes;
                }
            }
        }
        Ok(ScanStats {
            inspected_traces: 0,
            inspected_bytes: file.bytes_read(),
        })
    }

    fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>> {
        self.open_file(ctx)?.find_trace(ctx, id)
    }
}
