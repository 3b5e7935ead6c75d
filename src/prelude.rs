//! Convenient imports for spanstore.
//!
//! ```ignore
//! use spanstore::prelude::*;
//!
//! let store = SpanStore::open("./data")?;
//! ```

// Main entry point
pub use crate::store::{SpanStore, SpanStoreBuilder};

// Error handling
pub use spanstore_core::{Error, Result};

// Trace model
pub use spanstore_core::{
    decode_trace, encode_fragment, AttrValue, Attribute, BlockId, Resource, ResourceSpans, Scope,
    ScopeSpans, Span, SpanKind, StatusCode, Trace, TraceId,
};

// Configuration
pub use spanstore_core::{IngesterConfig, Limits, Overrides, StaticOverrides, SyncMode};

// Search
pub use spanstore_search::{SearchRequest, SearchResponse, SpanMetricsRequest};

// Backends
pub use spanstore_storage::{LocalBackend, MemoryBackend, StorageBackend};
