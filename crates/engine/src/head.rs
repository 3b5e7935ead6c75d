//! Head and completing blocks
//!
//! A head block is a segment file `<tenant wal dir>/<block_id>.head` of
//! combined traces, one record per cut trace. The same trace id can appear
//! in several records when fragments arrive after a cut; readers combine
//! them. Sealing closes the writer; a sealed head waits in the completing
//! list until it is encoded as a columnar block.
//!
//! Reads go through one [`FileRangeReader`] opened with the block, using an
//! index of record locations snapshotted under the state lock. Records
//! appended afterwards are not seen. The handle stays valid after the file
//! is unlinked, so a search holding the block finishes after a clear.

use crate::combiner::TraceCombiner;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use spanstore_core::{
    decode_trace, encode_trace, BlockId, Context, Error, Result, SyncMode, Trace, TraceId,
};
use spanstore_durability::{decode_record, read_segment, RecordLocation, SegmentWriter};
use spanstore_search::{ScanRequest, ScanStats, SearchShard, ShardKind, TraceView, Visit};
use spanstore_storage::{FileRangeReader, ReadAt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// File extension of head block files.
pub const HEAD_EXTENSION: &str = "head";

#[derive(Debug)]
struct HeadState {
    writer: Option<SegmentWriter>,
    index: Vec<(TraceId, RecordLocation)>,
    bytes: u64,
    start_nanos: u64,
    end_nanos: u64,
    created: Instant,
}

impl HeadState {
    fn track(&mut self, trace_id: TraceId, loc: RecordLocation, start: u64, end: u64) {
        self.index.push((trace_id, loc));
        self.bytes += u64::from(loc.len);
        if start != 0 && (self.start_nanos == 0 || start < self.start_nanos) {
            self.start_nanos = start;
        }
        self.end_nanos = self.end_nanos.max(end);
    }
}

/// An append-only block of combined traces backed by one file.
pub struct HeadBlock {
    block_id: BlockId,
    tenant: String,
    path: PathBuf,
    reader: FileRangeReader,
    state: Mutex<HeadState>,
}

impl std::fmt::Debug for HeadBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeadBlock")
            .field("block_id", &self.block_id)
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .finish()
    }
}

impl HeadBlock {
    /// Create an empty head file in `dir`.
    pub fn create(dir: &Path, tenant: &str, sync_mode: SyncMode) -> Result<Self> {
        let block_id = BlockId::new();
        let path = head_path(dir, block_id);
        let segment_id = block_id.as_uuid().as_u64_pair().0;
        let writer = SegmentWriter::create(&path, segment_id, sync_mode)?;
        let reader = FileRangeReader::open(&path)?;
        debug!(tenant, block_id = %block_id, "created head block");
        Ok(Self {
            block_id,
            tenant: tenant.to_string(),
            path,
            reader,
            state: Mutex::new(HeadState {
                writer: Some(writer),
                index: Vec::new(),
                bytes: 0,
                start_nanos: 0,
                end_nanos: 0,
                created: Instant::now(),
            }),
        })
    }

    /// Rebuild a sealed head from its file, skipping damaged records.
    ///
    /// Returns the block and the number of records skipped.
    pub fn replay(path: &Path, tenant: &str) -> Result<(Self, u64)> {
        let block_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Corruption(format!("bad head file name {}", path.display())))
            .and_then(BlockId::parse)?;

        let contents = read_segment(path)?;
        let mut skipped = contents.corrupt_records;
        let mut state = HeadState {
            writer: None,
            index: Vec::with_capacity(contents.records.len()),
            bytes: 0,
            start_nanos: 0,
            end_nanos: 0,
            created: Instant::now(),
        };
        for (loc, record) in contents.records {
            match decode_trace(&record.payload) {
                Ok(trace) => state.track(
                    record.trace_id,
                    loc,
                    trace.start_time_unix_nano,
                    trace.end_time_unix_nano,
                ),
                Err(e) => {
                    warn!(tenant, block_id = %block_id, error = %e, "skipping bad head record");
                    skipped += 1;
                }
            }
        }

        Ok((
            Self {
                block_id,
                tenant: tenant.to_string(),
                path: path.to_path_buf(),
                reader: FileRangeReader::open(path)?,
                state: Mutex::new(state),
            },
            skipped,
        ))
    }

    /// Append one combined trace.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the head is sealed.
    pub fn append(&self, trace: &Trace) -> Result<()> {
        let payload = encode_trace(trace)?;
        let mut state = self.state.lock();
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| Error::InvalidState(format!("head {} is sealed", self.block_id)))?;
        let loc = writer.append(&trace.trace_id, &payload)?;
        state.track(
            trace.trace_id,
            loc,
            trace.start_time_unix_nano,
            trace.end_time_unix_nano,
        );
        Ok(())
    }

    /// Flush appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        if let Some(writer) = self.state.lock().writer.as_mut() {
            writer.sync()?;
        }
        Ok(())
    }

    /// Sync and close the writer. Sealing twice is a no-op.
    pub fn seal(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.sync()?;
        }
        Ok(())
    }

    /// Whether the writer is closed.
    pub fn is_sealed(&self) -> bool {
        self.state.lock().writer.is_none()
    }

    /// Block id.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Owning tenant.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// Head file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended (a trace cut twice counts twice).
    pub fn trace_count(&self) -> usize {
        self.state.lock().index.len()
    }

    /// Record bytes appended.
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Whether nothing was appended.
    pub fn is_empty(&self) -> bool {
        self.state.lock().index.is_empty()
    }

    /// Time since the head was created or replayed.
    pub fn age(&self) -> Duration {
        self.state.lock().created.elapsed()
    }

    /// Time bounds of the appended traces, unix nanoseconds.
    pub fn time_range_nanos(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.start_nanos, state.end_nanos)
    }

    /// Every trace in the head, duplicates combined, in first-append order.
    pub fn read_all(&self, ctx: &Context) -> Result<Vec<Trace>> {
        let mut traces = Vec::new();
        self.for_each_trace(ctx, None, &mut |trace: Trace| {
            traces.push(trace);
            Visit::Continue
        })?;
        Ok(traces)
    }

    /// The combined partial of `id`, if present.
    pub fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>> {
        let mut found = None;
        self.for_each_trace(ctx, Some(id), &mut |trace: Trace| {
            found = Some(trace);
            Visit::Stop
        })?;
        Ok(found)
    }

    /// Remove the head file. A missing file is not an error.
    pub fn delete(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn for_each_trace(
        &self,
        ctx: &Context,
        only: Option<&TraceId>,
        visit: &mut dyn FnMut(Trace) -> Visit,
    ) -> Result<ScanStats> {
        ctx.check()?;
        let index: Vec<(TraceId, RecordLocation)> = {
            let state = self.state.lock();
            match only {
                Some(id) => state.index.iter().filter(|(t, _)| t == id).cloned().collect(),
                None => state.index.clone(),
            }
        };
        if index.is_empty() {
            return Ok(ScanStats::default());
        }

        // Group record locations by trace id, keeping first-append order.
        let mut order: Vec<TraceId> = Vec::new();
        let mut groups: FxHashMap<TraceId, Vec<RecordLocation>> = FxHashMap::default();
        for (id, loc) in index {
            groups
                .entry(id)
                .or_insert_with(|| {
                    order.push(id);
                    Vec::new()
                })
                .push(loc);
        }

        let mut stats = ScanStats::default();
        for id in order {
            ctx.check()?;
            let mut combiner = TraceCombiner::new();
            for loc in &groups[&id] {
                combiner.consume(self.read_record(ctx, loc)?);
                stats.inspected_bytes += u64::from(loc.len);
            }
            let Some(trace) = combiner.result().0 else {
                continue;
            };
            stats.inspected_traces += 1;
            if visit(trace) == Visit::Stop {
                break;
            }
        }
        Ok(stats)
    }

    fn read_record(&self, ctx: &Context, loc: &RecordLocation) -> Result<Option<Trace>> {
        let mut buf = vec![0u8; loc.len as usize];
        self.reader.read_at(ctx, &mut buf, loc.offset)?;
        let decoded = decode_record(&buf).and_then(|record| decode_trace(&record.payload));
        match decoded {
            Ok(trace) => Ok(Some(trace)),
            Err(e) if e.is_corruption() => {
                warn!(
                    tenant = %self.tenant,
                    block_id = %self.block_id,
                    offset = loc.offset,
                    error = %e,
                    "skipping corrupt head record"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Path of the head file for `block_id`.
pub fn head_path(dir: &Path, block_id: BlockId) -> PathBuf {
    dir.join(format!("{}.{}", block_id, HEAD_EXTENSION))
}

/// Head files in `dir`.
pub fn list_head_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == HEAD_EXTENSION) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Search shard over a head or completing block.
pub struct HeadShard {
    block: Arc<HeadBlock>,
    kind: ShardKind,
}

impl HeadShard {
    /// Shard over `block`, reported as `kind`.
    pub fn new(block: Arc<HeadBlock>, kind: ShardKind) -> Self {
        Self { block, kind }
    }
}

impl SearchShard for HeadShard {
    fn kind(&self) -> ShardKind {
        self.kind
    }

    fn label(&self) -> String {
        format!("{}:{}", self.kind, self.block.block_id())
    }

    fn scan(
        &self,
        ctx: &Context,
        request: &ScanRequest<'_>,
        visit: &mut dyn FnMut(TraceView) -> Visit,
    ) -> Result<ScanStats> {
        let (start, end) = self.block.time_range_nanos();
        if (request.start_nanos != 0 && end < request.start_nanos)
            || (request.end_nanos != 0 && start > request.end_nanos)
        {
            return Ok(ScanStats::default());
        }
        self.block.for_each_trace(ctx, None, &mut |trace: Trace| {
            let view = TraceView::from_trace(trace, request.need_bodies);
            if !(request.prefilter)(&view.summary, &view.tags) {
                return Visit::Continue;
            }
            visit(view)
        })
    }

    fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>> {
        self.block.find_trace(ctx, id)
    }
}
