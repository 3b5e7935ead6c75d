//! In-memory object store
//!
//! Used as the flush target in tests and single-process setups. Reads can
//! be made to fail on demand to exercise retry and shard-failure paths.

use crate::backend::{StorageBackend, META_OBJECT};
use dashmap::DashMap;
use spanstore_core::{BlockId, Context, Error, Result};
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type ObjectKey = (String, BlockId, String);

/// DashMap-backed [`StorageBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: DashMap<ObjectKey, Arc<Vec<u8>>>,
    failing_reads: AtomicUsize,
    reads: AtomicU64,
}

impl MemoryBackend {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads fail with a transient I/O error.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Number of read calls served (including failed ones).
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of stored objects.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn injected_failure(&self) -> Result<()> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let took = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected read failure",
            ))),
            Err(_) => Ok(()),
        }
    }

    fn get(&self, tenant: &str, block: BlockId, object: &str) -> Result<Arc<Vec<u8>>> {
        self.objects
            .get(&(tenant.to_string(), block, object.to_string()))
            .map(|v| Arc::clone(v.value()))
            .ok_or_else(|| Error::NotFound(format!("{}/{}/{}", tenant, block, object)))
    }
}

impl StorageBackend for MemoryBackend {
    fn read(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        ctx.check()?;
        self.injected_failure()?;
        let data = self.get(tenant, block, object)?;
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(Error::Corruption(format!(
                "short read of {}/{}/{} at {}+{}",
                tenant,
                block,
                object,
                offset,
                buf.len()
            )));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn read_all(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
    ) -> Result<Vec<u8>> {
        ctx.check()?;
        self.injected_failure()?;
        Ok(self.get(tenant, block, object)?.as_ref().clone())
    }

    fn write(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        data: &[u8],
    ) -> Result<()> {
        ctx.check()?;
        self.objects.insert(
            (tenant.to_string(), block, object.to_string()),
            Arc::new(data.to_vec()),
        );
        Ok(())
    }

    fn delete_block(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<()> {
        ctx.check()?;
        self.objects.retain(|(t, b, _), _| !(t == tenant && *b == block));
        Ok(())
    }

    fn list_blocks(&self, ctx: &Context, tenant: &str) -> Result<Vec<BlockId>> {
        ctx.check()?;
        let mut blocks: Vec<BlockId> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == tenant && e.key().2 == META_OBJECT)
            .map(|e| e.key().1)
            .collect();
        blocks.sort();
        Ok(blocks)
    }
}
