//! Core types for spanstore
//!
//! This crate defines the vocabulary shared by every other crate:
//! - TraceId / BlockId: identifiers
//! - Trace model: resource spans, spans, summaries and tag entries
//! - Codec: versioned fragment and combined-trace encodings
//! - Error: the single error enum and `Result` alias
//! - Context: cancellation and deadlines for read paths
//! - Overrides: per-tenant limits
//! - Config: ingester configuration with validation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod ids;
pub mod overrides;
pub mod trace;

pub use codec::{decode_fragment, decode_trace, encode_fragment, encode_trace};
pub use config::{
    BlockConfig, CacheControl, ConfigWarning, IngesterConfig, SearchConfig, SyncMode, WalConfig,
};
pub use context::{CancellationToken, Context};
pub use error::{Error, Result};
pub use ids::{BlockId, TraceId, TRACE_ID_LEN};
pub use overrides::{Limits, Overrides, StaticOverrides};
pub use trace::{
    AttrValue, Attribute, Resource, ResourceSpans, Scope, ScopeSpans, Span, SpanKind, StatusCode,
    TagEntry, TagScope, Trace, TraceSummary, SERVICE_NAME_KEY,
};
