//! Tiered block reader stack
//!
//! A completed block is read through three layers, each owning the next:
//!
//! ```text
//! CacheSectionReader         exact matches of declared sections -> cache
//!   FormatShortCircuitReader header magic / trailer answered from meta
//!     BackendRangeReader     ranged backend reads, byte accounting
//! ```
//!
//! A fresh stack is built for every query so the byte count of the
//! innermost layer is that query's inspected bytes. Section reads routed to
//! the cache are metadata and stay out of that count. Head files have no
//! footer for the upper layers to recognise and use [`FileRangeReader`].

use crate::backend::{StorageBackend, DATA_OBJECT};
use crate::cache::{CacheKey, RangeCache};
use crate::format::{MAGIC, TRAILER_LEN};
use crate::meta::BlockMeta;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use spanstore_core::{BlockId, CacheControl, Context, Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Positional reads.
pub trait ReadAt: Send + Sync {
    /// Fill `buf` from `offset`.
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Total size of the underlying object.
    fn size(&self) -> u64;
}

impl<T: ReadAt + ?Sized> ReadAt for Arc<T> {
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        (**self).read_at(ctx, buf, offset)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// Block file section kinds the opener declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    /// Footer
    Footer,
    /// Per-row-group column index
    ColumnIndex,
    /// Per-chunk offset index
    OffsetIndex,
}

/// Reader the block opener can declare sections on.
pub trait SectionReader: ReadAt {
    /// Declare `[offset, offset + len)` as a section of `kind`.
    fn declare_section(&self, kind: SectionKind, offset: u64, len: u64);

    /// Bytes read so far through this stack.
    fn bytes_read(&self) -> u64;
}

/// Innermost layer: ranged reads of one block object.
pub struct BackendRangeReader {
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<RangeCache>>,
    tenant: String,
    block: BlockId,
    object: String,
    size: u64,
    bytes_read: AtomicU64,
}

impl BackendRangeReader {
    /// Reader over the data object of the block described by `meta`.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        cache: Option<Arc<RangeCache>>,
        meta: &BlockMeta,
    ) -> Self {
        Self {
            backend,
            cache,
            tenant: meta.tenant.clone(),
            block: meta.block_id,
            object: DATA_OBJECT.to_string(),
            size: meta.size,
            bytes_read: AtomicU64::new(0),
        }
    }

    /// Bytes read through [`ReadAt::read_at`].
    ///
    /// Reads that go through [`BackendRangeReader::read_at_cached`] are not
    /// counted, hit or miss: the footer and index sections are block
    /// metadata, not inspected trace data.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Read through the shared cache when one is configured. Not counted
    /// in [`BackendRangeReader::bytes_read`].
    pub fn read_at_cached(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        let Some(cache) = &self.cache else {
            return self.fetch(ctx, buf, offset);
        };
        ctx.check()?;
        let key = CacheKey {
            block: self.block,
            tenant: self.tenant.clone(),
            object: self.object.clone(),
            offset,
            len: buf.len() as u64,
        };
        if let Some(hit) = cache.get(&key) {
            if hit.len() == buf.len() {
                buf.copy_from_slice(&hit);
                return Ok(());
            }
        }
        self.fetch(ctx, buf, offset)?;
        cache.put(key, Arc::from(&buf[..]));
        Ok(())
    }

    fn fetch(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        self.backend
            .read(ctx, &self.tenant, self.block, &self.object, offset, buf)
    }
}

impl ReadAt for BackendRangeReader {
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        self.fetch(ctx, buf, offset)?;
        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Answers the format's fixed reads from block meta.
pub struct FormatShortCircuitReader<R> {
    next: R,
    size: u64,
    footer_size: u32,
}

impl<R: ReadAt> FormatShortCircuitReader<R> {
    /// Wrap `next` for a block of `size` bytes with a `footer_size` footer.
    pub fn new(next: R, size: u64, footer_size: u32) -> Self {
        Self {
            next,
            size,
            footer_size,
        }
    }
}

impl<R: ReadAt> ReadAt for FormatShortCircuitReader<R> {
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset == 0 && buf.len() == MAGIC.len() {
            buf.copy_from_slice(MAGIC);
            return Ok(());
        }
        if self.footer_size > 0
            && buf.len() == TRAILER_LEN
            && offset + TRAILER_LEN as u64 == self.size
        {
            LittleEndian::write_u32(&mut buf[..4], self.footer_size);
            buf[4..].copy_from_slice(MAGIC);
            return Ok(());
        }
        self.next.read_at(ctx, buf, offset)
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// Routes reads of declared sections through the shared cache.
pub struct CacheSectionReader<R> {
    next: R,
    backend: Arc<BackendRangeReader>,
    cache_control: CacheControl,
    sections: RwLock<FxHashMap<u64, u64>>,
}

impl<R: ReadAt> CacheSectionReader<R> {
    /// Wrap `next`; cached reads go to `backend`.
    pub fn new(next: R, backend: Arc<BackendRangeReader>, cache_control: CacheControl) -> Self {
        Self {
            next,
            backend,
            cache_control,
            sections: RwLock::new(FxHashMap::default()),
        }
    }

    fn is_cached_section(&self, offset: u64, len: u64) -> bool {
        self.sections.read().get(&offset) == Some(&len)
    }
}

impl<R: ReadAt> ReadAt for CacheSectionReader<R> {
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        if self.is_cached_section(offset, buf.len() as u64) {
            return self.backend.read_at_cached(ctx, buf, offset);
        }
        self.next.read_at(ctx, buf, offset)
    }

    fn size(&self) -> u64 {
        self.next.size()
    }
}

impl<R: ReadAt> SectionReader for CacheSectionReader<R> {
    fn declare_section(&self, kind: SectionKind, offset: u64, len: u64) {
        let enabled = match kind {
            SectionKind::Footer => self.cache_control.footer,
            SectionKind::ColumnIndex => self.cache_control.column_index,
            SectionKind::OffsetIndex => self.cache_control.offset_index,
        };
        if enabled {
            self.sections.write().insert(offset, len);
        }
    }

    fn bytes_read(&self) -> u64 {
        self.backend.bytes_read()
    }
}

/// The assembled stack for a completed block.
pub type BlockReaderStack =
    CacheSectionReader<FormatShortCircuitReader<Arc<BackendRangeReader>>>;

/// Build a fresh reader stack for one query over the block `meta`.
pub fn open_block_reader(
    backend: Arc<dyn StorageBackend>,
    cache: Option<Arc<RangeCache>>,
    meta: &BlockMeta,
    cache_control: CacheControl,
) -> BlockReaderStack {
    let inner = Arc::new(BackendRangeReader::new(backend, cache, meta));
    let short_circuit =
        FormatShortCircuitReader::new(Arc::clone(&inner), meta.size, meta.footer_size);
    CacheSectionReader::new(short_circuit, inner, cache_control)
}

/// Counting reader over a local file (head and completing blocks).
pub struct FileRangeReader {
    file: Mutex<File>,
    size: u64,
    bytes_read: AtomicU64,
}

impl FileRangeReader {
    /// Open `path` for positional reads.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
            bytes_read: AtomicU64::new(0),
        })
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }
}

impl ReadAt for FileRangeReader {
    fn read_at(&self, ctx: &Context, buf: &mut [u8], offset: u64) -> Result<()> {
        ctx.check()?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                Error::Corruption(format!("short read at {}+{}", offset, buf.len()))
            }
            _ => Error::Io(e),
        })?;
        self.bytes_read.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn stored_block(len: usize, footer_size: u32) -> (Arc<MemoryBackend>, BlockMeta) {
        let backend = Arc::new(MemoryBackend::new());
        let mut meta = BlockMeta::new(BlockId::new(), "t", 1, 2);
        meta.size = len as u64;
        meta.footer_size = footer_size;
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        backend
            .write(&Context::background(), "t", meta.block_id, DATA_OBJECT, &data)
            .unwrap();
        (backend, meta)
    }

    #[test]
    fn test_magic_and_trailer_skip_backend() {
        let (backend, meta) = stored_block(64, 12);
        let stack = open_block_reader(backend.clone(), None, &meta, CacheControl::default());
        let ctx = Context::background();

        let mut magic = [0u8; 4];
        stack.read_at(&ctx, &mut magic, 0).unwrap();
        assert_eq!(&magic, MAGIC);

        let mut trailer = [0u8; 8];
        stack.read_at(&ctx, &mut trailer, 56).unwrap();
        assert_eq!(LittleEndian::read_u32(&trailer[..4]), 12);
        assert_eq!(&trailer[4..], MAGIC);

        assert_eq!(backend.read_count(), 0);
        assert_eq!(stack.bytes_read(), 0);
    }

    #[test]
    fn test_declared_sections_hit_cache_across_stacks() {
        let (backend, meta) = stored_block(64, 12);
        let cache = Arc::new(RangeCache::new(1 << 20));
        let ctx = Context::background();

        for round in 0..2 {
            let stack = open_block_reader(
                backend.clone(),
                Some(Arc::clone(&cache)),
                &meta,
                CacheControl::default(),
            );
            stack.declare_section(SectionKind::Footer, 44, 12);
            let mut footer = [0u8; 12];
            stack.read_at(&ctx, &mut footer, 44).unwrap();
            assert_eq!(footer[0], 44);
            assert_eq!(stack.bytes_read(), 0, "round {}", round);

            let mut chunk = [0u8; 6];
            stack.read_at(&ctx, &mut chunk, 10).unwrap();
            assert_eq!(stack.bytes_read(), 6, "round {}", round);
        }
        assert_eq!(backend.read_count(), 3);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_undeclared_and_disabled_sections_bypass_cache() {
        let (backend, meta) = stored_block(64, 12);
        let cache = Arc::new(RangeCache::new(1 << 20));
        let ctx = Context::background();
        let control = CacheControl {
            footer: false,
            ..CacheControl::default()
        };

        for _ in 0..2 {
            let stack =
                open_block_reader(backend.clone(), Some(Arc::clone(&cache)), &meta, control);
            stack.declare_section(SectionKind::Footer, 44, 12);
            let mut buf = [0u8; 12];
            stack.read_at(&ctx, &mut buf, 44).unwrap();
            let mut other = [0u8; 3];
            stack.read_at(&ctx, &mut other, 10).unwrap();
        }
        assert_eq!(backend.read_count(), 4);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_file_reader_counts_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("head");
        std::fs::write(&path, b"0123456789").unwrap();
        let reader = FileRangeReader::open(&path).unwrap();
        let mut buf = [0u8; 3];
        reader.read_at(&Context::background(), &mut buf, 7).unwrap();
        assert_eq!(&buf, b"789");
        assert_eq!(reader.bytes_read(), 3);
        assert!(reader
            .read_at(&Context::background(), &mut buf, 9)
            .unwrap_err()
            .is_corruption());
    }
}
