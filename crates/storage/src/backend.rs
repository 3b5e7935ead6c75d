//! Object store abstraction
//!
//! Blocks are addressed as `<tenant>/<block_id>/<object>`. A block has two
//! objects: the columnar [`DATA_OBJECT`] and the [`META_OBJECT`] sidecar.
//! The sidecar is written last and is the commit point: a block without a
//! readable meta does not exist.

use crate::meta::BlockMeta;
use spanstore_core::{BlockId, Context, Result};

/// Columnar block file object name.
pub const DATA_OBJECT: &str = "data.spb";

/// Block meta sidecar object name.
pub const META_OBJECT: &str = "meta.json";

/// Object store consumed by the flusher and the completed-block readers.
pub trait StorageBackend: Send + Sync {
    /// Fill `buf` from `object` starting at `offset`.
    fn read(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()>;

    /// Read a whole object.
    fn read_all(&self, ctx: &Context, tenant: &str, block: BlockId, object: &str)
        -> Result<Vec<u8>>;

    /// Write a whole object, replacing any previous content.
    fn write(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        data: &[u8],
    ) -> Result<()>;

    /// Write a block: data first, then the meta sidecar.
    fn write_block(&self, ctx: &Context, meta: &BlockMeta, data: &[u8]) -> Result<()> {
        self.write(ctx, &meta.tenant, meta.block_id, DATA_OBJECT, data)?;
        let json = meta.to_json()?;
        self.write(ctx, &meta.tenant, meta.block_id, META_OBJECT, &json)
    }

    /// Read and parse a block's meta sidecar.
    fn read_meta(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<BlockMeta> {
        let bytes = self.read_all(ctx, tenant, block, META_OBJECT)?;
        BlockMeta::from_json(&bytes)
    }

    /// Remove every object of a block. Deleting a missing block is not an error.
    fn delete_block(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<()>;

    /// Blocks of `tenant` that have a meta sidecar.
    fn list_blocks(&self, ctx: &Context, tenant: &str) -> Result<Vec<BlockId>>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for std::sync::Arc<T> {
    fn read(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        (**self).read(ctx, tenant, block, object, offset, buf)
    }

    fn read_all(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
    ) -> Result<Vec<u8>> {
        (**self).read_all(ctx, tenant, block, object)
    }

    fn write(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        data: &[u8],
    ) -> Result<()> {
        (**self).write(ctx, tenant, block, object, data)
    }

    fn write_block(&self, ctx: &Context, meta: &BlockMeta, data: &[u8]) -> Result<()> {
        (**self).write_block(ctx, meta, data)
    }

    fn delete_block(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<()> {
        (**self).delete_block(ctx, tenant, block)
    }

    fn list_blocks(&self, ctx: &Context, tenant: &str) -> Result<Vec<BlockId>> {
        (**self).list_blocks(ctx, tenant)
    }
}
