//! Concurrency Integration Tests
//!
//! Pushes, cuts, block cuts and searches racing on the same instance.

#[path = "../common/mod.rs"]
mod common;

mod races;
