//! Columnar block file format ("SPB1")
//!
//! ```text
//! magic "SPB1"
//! row group 0: [ids][summaries][tags][bodies]   zstd(bincode(column))
//! row group 1: ...
//! column index   bincode(Vec<RowGroupIndex>)
//! offset index   bincode(Vec<[ChunkLocation; 4]>)
//! footer         bincode(Footer)
//! u32 footer_len (LE)
//! magic "SPB1"
//! ```
//!
//! Traces are sorted by id, so a row group's `[min_id, max_id]` range in
//! the column index decides whether it can hold a given trace. Every chunk
//! carries an xxh3 checksum in the offset index.

pub mod reader;
pub mod writer;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use spanstore_core::{Error, Result, TraceId};

pub use reader::BlockFile;
pub use writer::{encode_block, EncodedBlock};

/// File magic, at both ends.
pub const MAGIC: &[u8; 4] = b"SPB1";

/// `u32 footer_len` + magic.
pub const TRAILER_LEN: usize = 8;

/// Current file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of columns per row group.
pub const COLUMN_COUNT: usize = 4;

/// Columns of a row group, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// `Vec<TraceId>`
    Ids = 0,
    /// `Vec<TraceSummary>`
    Summaries = 1,
    /// `Vec<Vec<TagEntry>>`
    Tags = 2,
    /// `Vec<Trace>`
    Bodies = 3,
}

/// Byte range of a file section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionLocation {
    /// Offset from the start of the file
    pub offset: u64,
    /// Length in bytes
    pub len: u64,
}

/// Byte range and checksum of one column chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkLocation {
    /// Offset from the start of the file
    pub offset: u64,
    /// Compressed length
    pub len: u64,
    /// xxh3 of the compressed bytes
    pub checksum: u64,
}

/// Column index entry of one row group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowGroupIndex {
    /// Smallest trace id
    pub min_id: TraceId,
    /// Largest trace id
    pub max_id: TraceId,
    /// Earliest trace start, unix nanoseconds
    pub min_start_nanos: u64,
    /// Latest trace end, unix nanoseconds
    pub max_end_nanos: u64,
    /// Traces in the row group
    pub trace_count: u32,
}

impl RowGroupIndex {
    /// Whether the row group can contain `id`.
    pub fn may_contain(&self, id: &TraceId) -> bool {
        self.min_id <= *id && *id <= self.max_id
    }

    /// Whether any trace in the row group can overlap `[start, end]` (unix
    /// nanoseconds, 0 = unbounded).
    pub fn overlaps(&self, start_nanos: u64, end_nanos: u64) -> bool {
        (start_nanos == 0 || self.max_end_nanos >= start_nanos)
            && (end_nanos == 0 || self.min_start_nanos <= end_nanos)
    }
}

/// File footer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Footer {
    /// Format version
    pub version: u32,
    /// Total traces
    pub trace_count: u64,
    /// Number of row groups
    pub row_groups: u32,
    /// Column index section
    pub column_index: SectionLocation,
    /// Offset index section
    pub offset_index: SectionLocation,
    /// Distinct span attribute keys, sorted
    pub span_tag_names: Vec<String>,
    /// Distinct resource attribute keys, sorted
    pub resource_tag_names: Vec<String>,
}

pub(crate) fn decode_section<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::Corruption(format!("bad {}: {}", what, e)))
}

pub(crate) fn encode_section<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}
