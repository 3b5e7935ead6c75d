//! Block encoder

use super::{
    encode_section, ChunkLocation, Footer, RowGroupIndex, SectionLocation, COLUMN_COUNT,
    FORMAT_VERSION, MAGIC,
};
use crate::meta::BlockMeta;
use byteorder::{LittleEndian, WriteBytesExt};
use serde::Serialize;
use spanstore_core::{BlockId, Error, Result, TagScope, Trace, TraceId, TraceSummary};
use std::collections::BTreeSet;
use xxhash_rust::xxh3::xxh3_64;

/// An encoded block file and the numbers its meta needs.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    /// The whole file
    pub data: Vec<u8>,
    /// Footer length
    pub footer_size: u32,
    /// Row groups written
    pub row_groups: u32,
    /// Traces written
    pub trace_count: u64,
    /// Earliest trace start, unix nanoseconds
    pub start_nanos: u64,
    /// Latest trace end, unix nanoseconds
    pub end_nanos: u64,
}

impl EncodedBlock {
    /// Meta sidecar describing this file.
    pub fn meta(&self, block_id: BlockId, tenant: &str) -> BlockMeta {
        let mut meta = BlockMeta::new(block_id, tenant, self.start_nanos, self.end_nanos);
        meta.total_objects = self.trace_count;
        meta.size = self.data.len() as u64;
        meta.footer_size = self.footer_size;
        meta.total_row_groups = self.row_groups;
        meta
    }
}

/// Encode `traces` into a block file.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if `traces` is not strictly sorted by id or
///   `row_group_traces` is 0
/// - [`Error::Serialization`] / [`Error::Io`] if a chunk cannot be encoded
pub fn encode_block(
    traces: &[Trace],
    row_group_traces: usize,
    zstd_level: i32,
) -> Result<EncodedBlock> {
    if row_group_traces == 0 {
        return Err(Error::InvalidArgument(
            "row_group_traces must be > 0".to_string(),
        ));
    }
    if traces.windows(2).any(|w| w[0].trace_id >= w[1].trace_id) {
        return Err(Error::InvalidArgument(
            "block traces must be strictly sorted by id".to_string(),
        ));
    }

    let mut data = Vec::with_capacity(4096);
    data.extend_from_slice(MAGIC);

    let mut column_index = Vec::new();
    let mut offset_index: Vec<[ChunkLocation; COLUMN_COUNT]> = Vec::new();
    let mut span_tags = BTreeSet::new();
    let mut resource_tags = BTreeSet::new();
    let mut start_nanos = 0u64;
    let mut end_nanos = 0u64;

    for group in traces.chunks(row_group_traces) {
        let ids: Vec<TraceId> = group.iter().map(|t| t.trace_id).collect();
        let summaries: Vec<TraceSummary> = group.iter().map(Trace::summary).collect();
        let tags: Vec<_> = group.iter().map(Trace::tag_entries).collect();

        for entry in tags.iter().flatten() {
            match entry.scope {
                TagScope::Span => span_tags.insert(entry.key.clone()),
                TagScope::Resource => resource_tags.insert(entry.key.clone()),
            };
        }

        let mut min_start = 0u64;
        let mut max_end = 0u64;
        for s in &summaries {
            let start = s.start_time_unix_nano;
            if start != 0 && (min_start == 0 || start < min_start) {
                min_start = start;
            }
            max_end = max_end.max(s.end_time_unix_nano);
        }
        if min_start != 0 && (start_nanos == 0 || min_start < start_nanos) {
            start_nanos = min_start;
        }
        end_nanos = end_nanos.max(max_end);

        column_index.push(RowGroupIndex {
            min_id: ids[0],
            max_id: ids[ids.len() - 1],
            min_start_nanos: min_start,
            max_end_nanos: max_end,
            trace_count: group.len() as u32,
        });
        offset_index.push([
            write_chunk(&mut data, &ids, zstd_level)?,
            write_chunk(&mut data, &summaries, zstd_level)?,
            write_chunk(&mut data, &tags, zstd_level)?,
            write_chunk(&mut data, group, zstd_level)?,
        ]);
    }

    let column_index_loc = write_section(&mut data, &column_index)?;
    let offset_index_loc = write_section(&mut data, &offset_index)?;

    let footer = Footer {
        version: FORMAT_VERSION,
        trace_count: traces.len() as u64,
        row_groups: column_index.len() as u32,
        column_index: column_index_loc,
        offset_index: offset_index_loc,
        span_tag_names: span_tags.into_iter().collect(),
        resource_tag_names: resource_tags.into_iter().collect(),
    };
    let footer_bytes = encode_section(&footer)?;
    data.extend_from_slice(&footer_bytes);
    data.write_u32::<LittleEndian>(footer_bytes.len() as u32)?;
    data.extend_from_slice(MAGIC);

    Ok(EncodedBlock {
        data,
        footer_size: footer_bytes.len() as u32,
        row_groups: footer.row_groups,
        trace_count: footer.trace_count,
        start_nanos,
        end_nanos,
    })
}

fn write_chunk<T: Serialize + ?Sized>(
    out: &mut Vec<u8>,
    value: &T,
    level: i32,
) -> Result<ChunkLocation> {
    let raw = bincode::serialize(value)?;
    let compressed = zstd::stream::encode_all(&raw[..], level)?;
    let loc = ChunkLocation {
        offset: out.len() as u64,
        len: compressed.len() as u64,
        checksum: xxh3_64(&compressed),
    };
    out.extend_from_slice(&compressed);
    Ok(loc)
}

fn write_section<T: Serialize>(out: &mut Vec<u8>, value: &T) -> Result<SectionLocation> {
    let bytes = encode_section(value)?;
    let loc = SectionLocation {
        offset: out.len() as u64,
        len: bytes.len() as u64,
    };
    out.extend_from_slice(&bytes);
    Ok(loc)
}
