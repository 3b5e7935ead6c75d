//! # spanstore
//!
//! Multi-tenant trace ingestion with tiered block storage.
//!
//! Pushed trace fragments land in a per-tenant push log and a live table.
//! Idle traces are cut to an append-only head block, heads are cut and
//! completed into compressed columnar blocks, and completed blocks are
//! flushed to an object store and eventually cleared locally. Search
//! federates over every tier at once.
//!
//! ## Quick Start
//!
//! ```ignore
//! use spanstore::prelude::*;
//!
//! let store = SpanStore::open("./data")?;
//! store.start()?;
//!
//! store.push("acme", &trace_id, &encode_fragment(&resource_spans)?)?;
//! let trace = store.find_trace_by_id("acme", &trace_id)?;
//!
//! store.close()?;
//! ```
//!
//! ## Crates
//!
//! - [`core`] - ids, trace model, codec, errors, limits and config
//! - [`storage`] - object store backends, range cache, block format
//! - [`durability`] - push log segments and replay
//! - [`search`] - requests, filters, collectors and the federator
//! - [`engine`] - combiner, tiers, tenant instances and the ingester

#![warn(missing_docs)]

mod store;

pub mod prelude;

pub use store::{SpanStore, SpanStoreBuilder};

pub use spanstore_core as core;
pub use spanstore_durability as durability;
pub use spanstore_engine as engine;
pub use spanstore_search as search;
pub use spanstore_storage as storage;

pub use spanstore_core::{Error, Result};
