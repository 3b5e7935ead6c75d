//! Tenant instances and block lifecycle for spanstore
//!
//! This crate ties the lower layers together:
//! - combiner: merges partial traces, deduplicates spans, assigns nested sets
//! - live: per-trace fragment buffer and its search shard
//! - head: the append-only head block file and its search shard
//! - completed: columnar blocks on local disk, flush markers
//! - instance: one tenant's tiers, push path, cut/complete/clear and search
//! - ingester: tenant registry and the periodic lifecycle workers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod combiner;
pub mod completed;
pub mod head;
pub mod ingester;
pub mod instance;
pub mod live;

pub use combiner::{combine_fragments, combine_traces, TraceCombiner};
pub use completed::CompletedBlock;
pub use head::{HeadBlock, HeadShard};
pub use ingester::{Ingester, IngesterBuilder, SweepStats};
pub use instance::{Instance, RecoveryReport};
pub use live::{LiveShard, LiveTraces};
