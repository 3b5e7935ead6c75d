//! Push log: the live table's write-ahead log
//!
//! Every accepted push is appended to the current generation before the live
//! table is updated. After a cut the log is rotated in two steps. First
//! appends move to a fresh generation, leaving the generation before it
//! free. Then the remaining live fragments are carried into that free
//! generation and made durable, and only then are older generations
//! deleted. Replay reads generations in order, so carried fragments come
//! before anything pushed after the rotation, and a crash at any point
//! replays every live fragment at least once.
//!
//! The first step is cheap and runs under the caller's live-table lock; the
//! carry write does not need it.
//!
//! Files: `<dir>/push_<generation:016x>.wal`.

use crate::segment::{read_segment, Record, SegmentWriter};
use spanstore_core::{Result, SyncMode, TraceId};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

const SEGMENT_PREFIX: &str = "push_";
const SEGMENT_EXTENSION: &str = "wal";

/// Outcome of replaying the push log on open.
#[derive(Debug, Default, Clone)]
pub struct ReplaySummary {
    /// Generations read
    pub segments_replayed: usize,
    /// Generations whose header was unreadable
    pub segments_skipped: usize,
    /// Records returned
    pub records_replayed: u64,
    /// Records skipped for a bad checksum or id
    pub corrupt_records_skipped: u64,
    /// Generations that ended inside a record
    pub truncated_segments: usize,
    /// Wall time spent replaying (microseconds)
    pub replay_time_micros: u64,
}

impl ReplaySummary {
    /// Get human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "push log replay: {} records from {} generations, {} corrupt, {} truncated, \
             {} skipped, {:.2}ms",
            self.records_replayed,
            self.segments_replayed,
            self.corrupt_records_skipped,
            self.truncated_segments,
            self.segments_skipped,
            self.replay_time_micros as f64 / 1000.0
        )
    }

    /// Check if replay had any issues (corruption, torn tails, bad headers)
    pub fn has_issues(&self) -> bool {
        self.corrupt_records_skipped > 0
            || self.truncated_segments > 0
            || self.segments_skipped > 0
    }
}

/// Generation-rotated write-ahead log of pushes.
#[derive(Debug)]
pub struct PushLog {
    dir: PathBuf,
    generation: u64,
    writer: SegmentWriter,
    sync_mode: SyncMode,
}

impl PushLog {
    /// Open the log in `dir`, replaying every existing generation.
    ///
    /// Returns the records of all generations in generation order, then
    /// file order. A new, empty generation is started for appends; older
    /// generations stay on disk until the next [`PushLog::rotate`].
    pub fn open(
        dir: impl Into<PathBuf>,
        sync_mode: SyncMode,
    ) -> Result<(Self, Vec<Record>, ReplaySummary)> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let start = Instant::now();

        let mut summary = ReplaySummary::default();
        let mut records = Vec::new();
        let segments = list_generations(&dir)?;
        for (generation, path) in &segments {
            match read_segment(path) {
                Ok(contents) => {
                    summary.segments_replayed += 1;
                    summary.corrupt_records_skipped += contents.corrupt_records;
                    if contents.truncated {
                        summary.truncated_segments += 1;
                    }
                    summary.records_replayed += contents.records.len() as u64;
                    records.extend(contents.records.into_iter().map(|(_, r)| r));
                    debug!(generation, "replayed push log generation");
                }
                Err(e) => {
                    warn!(generation, error = %e, "skipping unreadable push log generation");
                    summary.segments_skipped += 1;
                }
            }
        }

        let generation = segments.last().map(|(g, _)| g + 1).unwrap_or(1);
        let writer =
            SegmentWriter::create(segment_path(&dir, generation), generation, sync_mode)?;
        summary.replay_time_micros = start.elapsed().as_micros() as u64;
        if !segments.is_empty() {
            info!(dir = %dir.display(), "{}", summary.summary());
        }

        Ok((
            Self {
                dir,
                generation,
                writer,
                sync_mode,
            },
            records,
            summary,
        ))
    }

    /// Append one pushed fragment to the current generation.
    pub fn append(&mut self, trace_id: &TraceId, payload: &[u8]) -> Result<()> {
        self.writer.append(trace_id, payload)?;
        Ok(())
    }

    /// Rotate in one go: [`PushLog::begin_rotate`] then
    /// [`PendingCarry::write`]. Returns the new append generation.
    pub fn rotate<'a, I>(&mut self, carry: I) -> Result<u64>
    where
        I: IntoIterator<Item = (&'a TraceId, &'a [u8])>,
    {
        self.begin_rotate()?.write(carry)?;
        Ok(self.generation)
    }

    /// Move appends to a new generation and reserve the one before it for
    /// the carried fragments.
    ///
    /// Older generations stay on disk until the returned carry is written.
    /// Carries must be written in the order they were begun.
    pub fn begin_rotate(&mut self) -> Result<PendingCarry> {
        let carry_generation = self.generation + 1;
        let next = self.generation + 2;
        let writer = SegmentWriter::create(segment_path(&self.dir, next), next, self.sync_mode)?;
        self.writer = writer;
        self.generation = next;
        Ok(PendingCarry {
            dir: self.dir.clone(),
            generation: carry_generation,
            sync_mode: self.sync_mode,
        })
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Directory of the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Bytes in the current generation.
    pub fn current_len(&self) -> u64 {
        self.writer.len()
    }

    /// Generations on disk, oldest first.
    pub fn generations(&self) -> Result<Vec<u64>> {
        Ok(list_generations(&self.dir)?.into_iter().map(|(g, _)| g).collect())
    }
}

/// A carry generation reserved by [`PushLog::begin_rotate`].
#[derive(Debug)]
#[must_use = "older generations are only deleted once the carry is written"]
pub struct PendingCarry {
    dir: PathBuf,
    generation: u64,
    sync_mode: SyncMode,
}

impl PendingCarry {
    /// Generation the carry is written to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Write `carry`, sync it, then delete every older generation.
    ///
    /// On failure the older generations are kept, so nothing live is lost;
    /// the next rotation supersedes them.
    pub fn write<'a, I>(self, carry: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a TraceId, &'a [u8])>,
    {
        let path = segment_path(&self.dir, self.generation);
        let mut writer = SegmentWriter::create(path, self.generation, self.sync_mode)?;
        let mut carried = 0usize;
        for (id, payload) in carry {
            writer.append(id, payload)?;
            carried += 1;
        }
        writer.sync()?;

        for (generation, path) in list_generations(&self.dir)? {
            if generation < self.generation {
                if let Err(e) = fs::remove_file(&path) {
                    warn!(generation, error = %e, "failed to delete old push log generation");
                }
            }
        }
        debug!(generation = self.generation, carried, "rotated push log");
        Ok(())
    }
}

fn segment_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{}{:016x}.{}", SEGMENT_PREFIX, generation, SEGMENT_EXTENSION))
}

fn parse_generation(path: &Path) -> Option<u64> {
    if path.extension()? != SEGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    u64::from_str_radix(stem.strip_prefix(SEGMENT_PREFIX)?, 16).ok()
}

fn list_generations(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(generation) = parse_generation(&path) {
            out.push((generation, path));
        }
    }
    out.sort_by_key(|(g, _)| *g);
    Ok(out)
}
