//! Block meta sidecar (`meta.json`)

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use spanstore_core::{BlockId, Error, Result};

/// Meta format version.
pub const META_VERSION: u32 = 1;

/// Encoding name of the columnar block format.
pub const BLOCK_ENCODING: &str = "spb1";

/// Everything needed to open a block without reading it first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Meta format version
    pub version: u32,
    /// Block id
    pub block_id: BlockId,
    /// Owning tenant
    pub tenant: String,
    /// Earliest trace start
    pub start_time: DateTime<Utc>,
    /// Latest trace end
    pub end_time: DateTime<Utc>,
    /// Number of traces
    pub total_objects: u64,
    /// Size of the data object in bytes
    pub size: u64,
    /// Size of the footer in bytes
    pub footer_size: u32,
    /// Number of row groups
    pub total_row_groups: u32,
    /// Data encoding
    pub encoding: String,
}

impl BlockMeta {
    /// Meta for a freshly encoded block. Times are unix nanoseconds.
    pub fn new(
        block_id: BlockId,
        tenant: impl Into<String>,
        start_nanos: u64,
        end_nanos: u64,
    ) -> Self {
        Self {
            version: META_VERSION,
            block_id,
            tenant: tenant.into(),
            start_time: nanos_to_datetime(start_nanos),
            end_time: nanos_to_datetime(end_nanos),
            total_objects: 0,
            size: 0,
            footer_size: 0,
            total_row_groups: 0,
            encoding: BLOCK_ENCODING.to_string(),
        }
    }

    /// Serialize to the sidecar form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Parse a sidecar. An unreadable sidecar means the block is damaged.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let meta: BlockMeta = serde_json::from_slice(bytes)
            .map_err(|e| Error::Corruption(format!("bad block meta: {}", e)))?;
        if meta.version != META_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported block meta version {}",
                meta.version
            )));
        }
        Ok(meta)
    }

    /// Whether the block's time range overlaps `[start, end]` (unix seconds,
    /// 0 = unbounded).
    pub fn overlaps_secs(&self, start: u64, end: u64) -> bool {
        let block_start = self.start_time.timestamp().max(0) as u64;
        let block_end = self.end_time.timestamp().max(0) as u64;
        (start == 0 || block_end >= start) && (end == 0 || block_start <= end)
    }
}

fn nanos_to_datetime(nanos: u64) -> DateTime<Utc> {
    Utc.timestamp_nanos(nanos.min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_sidecar() {
        let mut meta = BlockMeta::new(BlockId::new(), "acme", 1_000_000_000, 5_000_000_000);
        meta.total_objects = 3;
        meta.size = 1234;
        let parsed = BlockMeta::from_json(&meta.to_json().unwrap()).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.start_time.timestamp(), 1);
    }

    #[test]
    fn test_garbage_is_corruption() {
        assert!(BlockMeta::from_json(b"{not json").unwrap_err().is_corruption());
    }

    #[test]
    fn test_overlap() {
        let meta = BlockMeta::new(BlockId::new(), "t", 10_000_000_000, 20_000_000_000);
        assert!(meta.overlaps_secs(0, 0));
        assert!(meta.overlaps_secs(15, 30));
        assert!(meta.overlaps_secs(0, 10));
        assert!(!meta.overlaps_secs(21, 0));
        assert!(!meta.overlaps_secs(1, 9));
    }
}
