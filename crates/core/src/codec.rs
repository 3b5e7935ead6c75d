//! Versioned binary encodings
//!
//! Two payload kinds cross a durability boundary:
//! - fragments, as pushed by clients and logged in the push log
//! - combined traces, as appended to head files
//!
//! Both are `[u8 version][bincode body]`. A fragment that fails to decode is
//! the client's fault ([`Error::Validation`]); a stored trace that fails to
//! decode is damaged on disk ([`Error::Corruption`]).

use crate::error::{Error, Result};
use crate::trace::{ResourceSpans, Trace};

/// Current fragment encoding version.
pub const FRAGMENT_ENCODING_VERSION: u8 = 1;

/// Current combined-trace encoding version.
pub const TRACE_ENCODING_VERSION: u8 = 1;

/// Encode one push's resource spans.
pub fn encode_fragment(resource_spans: &[ResourceSpans]) -> Result<Vec<u8>> {
    let body = bincode::serialize(resource_spans)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FRAGMENT_ENCODING_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a pushed fragment.
pub fn decode_fragment(bytes: &[u8]) -> Result<Vec<ResourceSpans>> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| Error::Validation("empty fragment".to_string()))?;
    if *version != FRAGMENT_ENCODING_VERSION {
        return Err(Error::Validation(format!(
            "unknown fragment encoding version {}",
            version
        )));
    }
    bincode::deserialize(body).map_err(|e| Error::Validation(format!("bad fragment: {}", e)))
}

/// Encode a combined trace.
pub fn encode_trace(trace: &Trace) -> Result<Vec<u8>> {
    let body = bincode::serialize(trace)?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(TRACE_ENCODING_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a stored combined trace.
pub fn decode_trace(bytes: &[u8]) -> Result<Trace> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| Error::Corruption("empty trace record".to_string()))?;
    if *version != TRACE_ENCODING_VERSION {
        return Err(Error::Corruption(format!(
            "unknown trace encoding version {}",
            version
        )));
    }
    bincode::deserialize(body).map_err(|e| Error::Corruption(format!("bad trace record: {}", e)))
}
