//! Block Lifecycle Integration Tests
//!
//! Traces moving live -> head -> completing -> completed -> flushed, and
//! staying searchable at every step.

#[path = "../common/mod.rs"]
mod common;

mod flush;
mod tiers;
