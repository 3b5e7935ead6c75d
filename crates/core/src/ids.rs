//! Identifier types
//!
//! - [`TraceId`]: 16-byte trace identifier shared by every span of a trace
//! - [`BlockId`]: UUID naming a block across all of its lifecycle states

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Length of a trace id in bytes.
pub const TRACE_ID_LEN: usize = 16;

/// Trace identifier
///
/// Shorter inputs are left-padded with zeros, so an 8-byte id pushed by an
/// older client and its 16-byte padded form name the same trace. The
/// all-zero default never comes out of [`TraceId::from_slice`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TraceId([u8; TRACE_ID_LEN]);

impl TraceId {
    /// Build a trace id from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the input is empty, longer than
    /// 16 bytes, or all zeros.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Validation("trace id is empty".to_string()));
        }
        if bytes.len() > TRACE_ID_LEN {
            return Err(Error::Validation(format!(
                "trace id is {} bytes, max {}",
                bytes.len(),
                TRACE_ID_LEN
            )));
        }
        if bytes.iter().all(|b| *b == 0) {
            return Err(Error::Validation("trace id is all zeros".to_string()));
        }
        let mut id = [0u8; TRACE_ID_LEN];
        id[TRACE_ID_LEN - bytes.len()..].copy_from_slice(bytes);
        Ok(TraceId(id))
    }

    /// Wrap an already padded id.
    pub fn from_bytes(bytes: [u8; TRACE_ID_LEN]) -> Self {
        TraceId(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; TRACE_ID_LEN] {
        &self.0
    }

    /// Lowercase hex form used in search responses.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(TRACE_ID_LEN * 2);
        for b in self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    /// Parse the hex form produced by [`TraceId::to_hex`].
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() % 2 != 0 {
            return Err(Error::Validation(format!("odd-length trace id: {}", hex)));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|e| Error::Validation(format!("bad trace id {}: {}", hex, e)))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Block identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(Uuid);

impl BlockId {
    /// Create a new random BlockId using UUID v4
    pub fn new() -> Self {
        BlockId(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        BlockId(id)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse the hyphenated form used in file names.
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(BlockId)
            .map_err(|e| Error::Validation(format!("bad block id {}: {}", s, e)))
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
