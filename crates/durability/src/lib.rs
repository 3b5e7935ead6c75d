//! Durability layer for spanstore
//!
//! This crate implements the on-disk logs behind the live table and head
//! blocks:
//! - Segment format: header plus `[len][crc32][id][payload]` records
//! - SegmentWriter / read_segment: append and tolerant replay
//! - PushLog: generation-rotated write-ahead log of pushes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod push_log;
pub mod segment;

pub use push_log::{PendingCarry, PushLog, ReplaySummary};
pub use segment::{
    decode_record, encode_record, read_segment, Record, RecordLocation, SegmentContents,
    SegmentWriter, SEGMENT_HEADER_SIZE,
};
