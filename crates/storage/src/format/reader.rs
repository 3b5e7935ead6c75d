//! Block file reader

use super::{
    decode_section, ChunkLocation, Column, Footer, RowGroupIndex, COLUMN_COUNT, FORMAT_VERSION,
    MAGIC, TRAILER_LEN,
};
use crate::reader::{SectionKind, SectionReader};
use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use spanstore_core::{
    Context, Error, Result, TagEntry, TagScope, Trace, TraceId, TraceSummary,
};
use xxhash_rust::xxh3::xxh3_64;

/// An opened block file.
///
/// Opening reads the header magic, the trailer, the footer and both
/// indexes; the footer and index reads are declared as sections first so
/// the reader stack can serve them from the shared cache. Column chunks
/// are read on demand.
pub struct BlockFile<R> {
    reader: R,
    footer: Footer,
    column_index: Vec<RowGroupIndex>,
    offset_index: Vec<[ChunkLocation; COLUMN_COUNT]>,
}

impl<R: SectionReader> BlockFile<R> {
    /// Open a block through `reader`.
    ///
    /// # Errors
    ///
    /// [`Error::Corruption`] if the magic, trailer, footer or indexes are
    /// malformed.
    pub fn open(ctx: &Context, reader: R) -> Result<Self> {
        let size = reader.size();
        if size < (MAGIC.len() + TRAILER_LEN) as u64 {
            return Err(Error::Corruption(format!("block file too small: {} bytes", size)));
        }

        let mut magic = [0u8; 4];
        reader.read_at(ctx, &mut magic, 0)?;
        if &magic != MAGIC {
            return Err(Error::Corruption("bad block header magic".to_string()));
        }

        let mut trailer = [0u8; TRAILER_LEN];
        reader.read_at(ctx, &mut trailer, size - TRAILER_LEN as u64)?;
        if &trailer[4..] != MAGIC {
            return Err(Error::Corruption("bad block trailer magic".to_string()));
        }
        let footer_len = LittleEndian::read_u32(&trailer[..4]) as u64;
        let body_end = size - TRAILER_LEN as u64;
        if footer_len == 0 || footer_len > body_end - MAGIC.len() as u64 {
            return Err(Error::Corruption(format!("bad footer length {}", footer_len)));
        }

        let footer_offset = body_end - footer_len;
        reader.declare_section(SectionKind::Footer, footer_offset, footer_len);
        let mut buf = vec![0u8; footer_len as usize];
        reader.read_at(ctx, &mut buf, footer_offset)?;
        let footer: Footer = decode_section(&buf, "block footer")?;
        if footer.version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported block format version {}",
                footer.version
            )));
        }

        let column_index: Vec<RowGroupIndex> = read_section(
            ctx,
            &reader,
            SectionKind::ColumnIndex,
            footer.column_index.offset,
            footer.column_index.len,
            footer_offset,
        )?;
        let offset_index: Vec<[ChunkLocation; COLUMN_COUNT]> = read_section(
            ctx,
            &reader,
            SectionKind::OffsetIndex,
            footer.offset_index.offset,
            footer.offset_index.len,
            footer_offset,
        )?;
        for (rg, chunks) in offset_index.iter().enumerate() {
            for chunk in chunks {
                if !in_body(chunk.offset, chunk.len, footer_offset) {
                    return Err(Error::Corruption(format!(
                        "row group {} chunk {}+{} outside block body",
                        rg, chunk.offset, chunk.len
                    )));
                }
            }
        }
        if column_index.len() != footer.row_groups as usize
            || offset_index.len() != footer.row_groups as usize
        {
            return Err(Error::Corruption(format!(
                "footer lists {} row groups, indexes have {} and {}",
                footer.row_groups,
                column_index.len(),
                offset_index.len()
            )));
        }

        Ok(Self {
            reader,
            footer,
            column_index,
            offset_index,
        })
    }

    /// The footer.
    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    /// Column index, one entry per row group.
    pub fn row_groups(&self) -> &[RowGroupIndex] {
        &self.column_index
    }

    /// Distinct attribute keys of one scope, sorted.
    pub fn tag_names(&self, scope: TagScope) -> &[String] {
        match scope {
            TagScope::Span => &self.footer.span_tag_names,
            TagScope::Resource => &self.footer.resource_tag_names,
        }
    }

    /// Bytes read through the underlying stack so far.
    pub fn bytes_read(&self) -> u64 {
        self.reader.bytes_read()
    }

    /// Trace ids of a row group.
    pub fn read_ids(&self, ctx: &Context, row_group: usize) -> Result<Vec<TraceId>> {
        self.read_column(ctx, row_group, Column::Ids)
    }

    /// Summaries of a row group.
    pub fn read_summaries(&self, ctx: &Context, row_group: usize) -> Result<Vec<TraceSummary>> {
        self.read_column(ctx, row_group, Column::Summaries)
    }

    /// Tag entries of a row group, one list per trace.
    pub fn read_tags(&self, ctx: &Context, row_group: usize) -> Result<Vec<Vec<TagEntry>>> {
        self.read_column(ctx, row_group, Column::Tags)
    }

    /// Full traces of a row group.
    pub fn read_bodies(&self, ctx: &Context, row_group: usize) -> Result<Vec<Trace>> {
        self.read_column(ctx, row_group, Column::Bodies)
    }

    /// Look up one trace by id, reading only row groups whose id range
    /// covers it.
    pub fn find_trace(&self, ctx: &Context, id: &TraceId) -> Result<Option<Trace>> {
        for (rg, index) in self.column_index.iter().enumerate() {
            if !index.may_contain(id) {
                continue;
            }
            let ids = self.read_ids(ctx, rg)?;
            if let Ok(pos) = ids.binary_search(id) {
                let mut bodies = self.read_bodies(ctx, rg)?;
                if pos < bodies.len() {
                    return Ok(Some(bodies.swap_remove(pos)));
                }
                return Err(Error::Corruption(format!(
                    "row group {} has {} ids but {} bodies",
                    rg,
                    ids.len(),
                    bodies.len()
                )));
            }
        }
        Ok(None)
    }

    fn read_column<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        row_group: usize,
        column: Column,
    ) -> Result<T> {
        ctx.check()?;
        let loc = self
            .offset_index
            .get(row_group)
            .map(|cols| cols[column as usize])
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "row group {} out of range ({} row groups)",
                    row_group,
                    self.offset_index.len()
                ))
            })?;

        let mut compressed = vec![0u8; loc.len as usize];
        self.reader.read_at(ctx, &mut compressed, loc.offset)?;
        if xxh3_64(&compressed) != loc.checksum {
            return Err(Error::Corruption(format!(
                "checksum mismatch in row group {} column {:?}",
                row_group, column
            )));
        }
        let raw = zstd::stream::decode_all(&compressed[..])
            .map_err(|e| Error::Corruption(format!("bad column chunk: {}", e)))?;
        decode_section(&raw, "column chunk")
    }
}

fn read_section<R: SectionReader, T: DeserializeOwned>(
    ctx: &Context,
    reader: &R,
    kind: SectionKind,
    offset: u64,
    len: u64,
    limit: u64,
) -> Result<T> {
    if !in_body(offset, len, limit) {
        return Err(Error::Corruption(format!(
            "{:?} section {}+{} outside block body",
            kind, offset, len
        )));
    }
    reader.declare_section(kind, offset, len);
    let mut buf = vec![0u8; len as usize];
    reader.read_at(ctx, &mut buf, offset)?;
    decode_section(&buf, "block index")
}

/// `offset..offset + len` must lie between the header magic and `limit`.
fn in_body(offset: u64, len: u64, limit: u64) -> bool {
    match offset.checked_add(len) {
        Some(end) => offset >= MAGIC.len() as u64 && end <= limit,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{StorageBackend, DATA_OBJECT};
    use crate::cache::RangeCache;
    use crate::format::encode_block;
    use crate::memory::MemoryBackend;
    use crate::meta::BlockMeta;
    use crate::reader::{open_block_reader, BlockReaderStack};
    use spanstore_core::{
        Attribute, BlockId, CacheControl, Resource, ResourceSpans, ScopeSpans, Span,
    };
    use std::sync::Arc;

    fn trace(n: u8) -> Trace {
        let mut span = Span {
            span_id: vec![n; 8],
            name: format!("op-{}", n),
            start_time_unix_nano: 1_000 * n as u64,
            end_time_unix_nano: 1_000 * n as u64 + 500,
            ..Default::default()
        };
        span.attrs.push(Attribute::new("http.method", "GET"));
        Trace::from_resource_spans(
            TraceId::from_slice(&[n; 16]).unwrap(),
            vec![ResourceSpans {
                resource: Resource {
                    service_name: "svc".into(),
                    attrs: vec![Attribute::new("region", "eu")],
                },
                scope_spans: vec![ScopeSpans {
                    scope: Default::default(),
                    spans: vec![span],
                }],
            }],
        )
    }

    fn store(traces: &[Trace], row_group_traces: usize) -> (Arc<MemoryBackend>, BlockMeta) {
        let encoded = encode_block(traces, row_group_traces, 3).unwrap();
        let meta = encoded.meta(BlockId::new(), "t");
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write(&Context::background(), "t", meta.block_id, DATA_OBJECT, &encoded.data)
            .unwrap();
        (backend, meta)
    }

    fn open(
        backend: &Arc<MemoryBackend>,
        meta: &BlockMeta,
        cache: Option<Arc<RangeCache>>,
    ) -> BlockFile<BlockReaderStack> {
        let stack = open_block_reader(backend.clone(), cache, meta, CacheControl::default());
        BlockFile::open(&Context::background(), stack).unwrap()
    }

    #[test]
    fn test_row_groups_and_columns() {
        let traces: Vec<Trace> = (1..=5).map(trace).collect();
        let (backend, meta) = store(&traces, 2);
        assert_eq!(meta.total_objects, 5);
        assert_eq!(meta.total_row_groups, 3);

        let block = open(&backend, &meta, None);
        let ctx = Context::background();
        assert_eq!(block.row_groups().len(), 3);
        assert_eq!(block.row_groups()[2].trace_count, 1);
        assert_eq!(block.read_ids(&ctx, 1).unwrap(), vec![traces[2].trace_id, traces[3].trace_id]);
        assert_eq!(block.read_summaries(&ctx, 0).unwrap()[1], traces[1].summary());
        assert_eq!(block.read_bodies(&ctx, 2).unwrap(), vec![traces[4].clone()]);
        assert!(block.read_tags(&ctx, 3).is_err());
    }

    #[test]
    fn test_tag_name_index_in_footer() {
        let (backend, meta) = store(&[trace(1)], 10);
        let block = open(&backend, &meta, None);
        assert_eq!(block.tag_names(TagScope::Span), ["http.method".to_string()]);
        assert_eq!(
            block.tag_names(TagScope::Resource),
            ["region".to_string(), "service.name".to_string()]
        );
    }

    #[test]
    fn test_find_trace() {
        let traces: Vec<Trace> = [1u8, 3, 5, 7].into_iter().map(trace).collect();
        let (backend, meta) = store(&traces, 2);
        let block = open(&backend, &meta, None);
        let ctx = Context::background();

        let found = block.find_trace(&ctx, &traces[2].trace_id).unwrap().unwrap();
        assert_eq!(found, traces[2]);

        let missing = TraceId::from_slice(&[4; 16]).unwrap();
        assert!(block.find_trace(&ctx, &missing).unwrap().is_none());
    }

    #[test]
    fn test_checksum_mismatch_is_corruption() {
        let traces: Vec<Trace> = (1..=2).map(trace).collect();
        let encoded = encode_block(&traces, 10, 3).unwrap();
        let meta = encoded.meta(BlockId::new(), "t");
        let mut data = encoded.data.clone();
        data[MAGIC.len() + 2] ^= 0xff;

        let backend = Arc::new(MemoryBackend::new());
        backend
            .write(&Context::background(), "t", meta.block_id, DATA_OBJECT, &data)
            .unwrap();
        let block = open(&backend, &meta, None);
        let err = block.read_ids(&Context::background(), 0).unwrap_err();
        assert!(err.is_corruption());
    }

    /// Re-encode the footer of `data` through `edit`. Fixed-width fields
    /// keep the footer length unchanged.
    fn rewrite_footer(data: &mut [u8], edit: impl FnOnce(&mut Footer)) -> Footer {
        let body_end = data.len() - TRAILER_LEN;
        let footer_len = LittleEndian::read_u32(&data[body_end..body_end + 4]) as usize;
        let footer_offset = body_end - footer_len;
        let mut footer: Footer =
            decode_section(&data[footer_offset..body_end], "footer").unwrap();
        edit(&mut footer);
        let encoded = crate::format::encode_section(&footer).unwrap();
        assert_eq!(encoded.len(), footer_len);
        data[footer_offset..body_end].copy_from_slice(&encoded);
        footer
    }

    fn open_corrupted(data: &[u8], meta: &BlockMeta) -> Result<BlockFile<BlockReaderStack>> {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write(&Context::background(), "t", meta.block_id, DATA_OBJECT, data)
            .unwrap();
        let stack = open_block_reader(backend, None, meta, CacheControl::default());
        BlockFile::open(&Context::background(), stack)
    }

    #[test]
    fn test_overflowing_section_length_is_corruption() {
        let encoded = encode_block(&[trace(1)], 10, 3).unwrap();
        let meta = encoded.meta(BlockId::new(), "t");
        let mut data = encoded.data.clone();
        rewrite_footer(&mut data, |footer| {
            footer.column_index.len = u64::MAX - footer.column_index.offset + 1;
        });
        let err = open_corrupted(&data, &meta).err().unwrap();
        assert!(err.is_corruption(), "{:?}", err);

        let mut data = encoded.data.clone();
        rewrite_footer(&mut data, |footer| footer.offset_index.len = u64::MAX);
        assert!(open_corrupted(&data, &meta).err().unwrap().is_corruption());
    }

    #[test]
    fn test_oversized_chunk_length_is_corruption() {
        let encoded = encode_block(&[trace(1), trace(2)], 1, 3).unwrap();
        let meta = encoded.meta(BlockId::new(), "t");
        let mut data = encoded.data.clone();
        let footer = rewrite_footer(&mut data, |_| {});

        let start = footer.offset_index.offset as usize;
        let end = start + footer.offset_index.len as usize;
        let mut offsets: Vec<[ChunkLocation; COLUMN_COUNT]> =
            decode_section(&data[start..end], "offset index").unwrap();
        offsets[1][Column::Bodies as usize].len = u64::MAX / 2;
        let encoded_offsets = crate::format::encode_section(&offsets).unwrap();
        assert_eq!(encoded_offsets.len(), end - start);
        data[start..end].copy_from_slice(&encoded_offsets);

        let err = open_corrupted(&data, &meta).err().unwrap();
        assert!(err.is_corruption(), "{:?}", err);
    }

    #[test]
    fn test_second_open_reads_indexes_from_cache() {
        let traces: Vec<Trace> = (1..=4).map(trace).collect();
        let (backend, meta) = store(&traces, 2);
        let cache = Arc::new(RangeCache::new(1 << 20));

        let first = open(&backend, &meta, Some(Arc::clone(&cache)));
        let reads_after_first = backend.read_count();
        assert_eq!(reads_after_first, 3);

        let second = open(&backend, &meta, Some(Arc::clone(&cache)));
        assert_eq!(backend.read_count(), reads_after_first);
        assert_eq!((first.bytes_read(), second.bytes_read()), (0, 0));
        assert_eq!(cache.stats().hits, 3);

        second.read_ids(&Context::background(), 0).unwrap();
        assert!(second.bytes_read() > 0);
    }

    #[test]
    fn test_unsorted_input_rejected() {
        let traces = vec![trace(2), trace(1)];
        assert!(matches!(
            encode_block(&traces, 10, 3),
            Err(Error::InvalidArgument(_))
        ));
    }
}
