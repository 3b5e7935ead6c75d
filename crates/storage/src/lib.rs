//! Storage layer for spanstore
//!
//! This crate implements everything below the block lifecycle:
//! - StorageBackend: object store trait, with local, in-memory and
//!   retrying implementations
//! - RangeCache: byte-range cache shared by all block readers
//! - Reader stack: backend range reads, format short-circuit, cached sections
//! - Block format: the columnar "SPB1" file and its `meta.json` sidecar

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod cache;
pub mod format;
pub mod local;
pub mod memory;
pub mod meta;
pub mod reader;
pub mod retry;

pub use backend::{StorageBackend, DATA_OBJECT, META_OBJECT};
pub use cache::{CacheKey, CacheStats, RangeCache};
pub use format::{encode_block, BlockFile, EncodedBlock, Footer, RowGroupIndex};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use meta::BlockMeta;
pub use reader::{
    open_block_reader, BackendRangeReader, BlockReaderStack, CacheSectionReader,
    FileRangeReader, FormatShortCircuitReader, ReadAt, SectionKind, SectionReader,
};
pub use retry::{BackendConfig, RetryingBackend};
