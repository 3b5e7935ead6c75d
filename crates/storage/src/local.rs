//! Local filesystem backend
//!
//! Layout: `<root>/<tenant>/<block_id>/<object>`. Writes go to a temporary
//! file that is renamed into place, so a reader never sees a torn object.

use crate::backend::{StorageBackend, META_OBJECT};
use spanstore_core::{BlockId, Context, Error, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Filesystem-backed [`StorageBackend`].
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Backend rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one tenant's blocks.
    pub fn tenant_dir(&self, tenant: &str) -> PathBuf {
        self.root.join(tenant)
    }

    /// Directory of one block.
    pub fn block_dir(&self, tenant: &str, block: BlockId) -> PathBuf {
        self.tenant_dir(tenant).join(block.to_string())
    }

    /// Path of one object.
    pub fn object_path(&self, tenant: &str, block: BlockId, object: &str) -> PathBuf {
        self.block_dir(tenant, block).join(object)
    }

    fn open_object(&self, tenant: &str, block: BlockId, object: &str) -> Result<File> {
        let path = self.object_path(tenant, block, object);
        File::open(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::NotFound(format!("{}/{}/{}", tenant, block, object))
            }
            _ => Error::Io(e),
        })
    }
}

impl StorageBackend for LocalBackend {
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
        let mut file = self.open_object(tenant, block, object)?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => Error::Corruption(format!(
                "short read of {}/{}/{} at {}+{}",
                tenant,
                block,
                object,
                offset,
                buf.len()
            )),
            _ => Error::Io(e),
        })
    }

    fn read_all(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
    ) -> Result<Vec<u8>> {
        ctx.check()?;
        let mut file = self.open_object(tenant, block, object)?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)?;
        Ok(out)
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
        let dir = self.block_dir(tenant, block);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!("{}.tmp", object));
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(object))?;
        debug!(tenant, block_id = %block, object, bytes = data.len(), "wrote object");
        Ok(())
    }

    fn delete_block(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<()> {
        ctx.check()?;
        match fs::remove_dir_all(self.block_dir(tenant, block)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn list_blocks(&self, ctx: &Context, tenant: &str) -> Result<Vec<BlockId>> {
        ctx.check()?;
        let entries = match fs::read_dir(self.tenant_dir(tenant)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut blocks = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(id) = BlockId::parse(name) else { continue };
            if entry.path().join(META_OBJECT).is_file() {
                blocks.push(id);
            }
        }
        blocks.sort();
        Ok(blocks)
    }
}
