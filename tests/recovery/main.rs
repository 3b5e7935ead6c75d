//! Crash Recovery Integration Tests
//!
//! A store is abandoned without shutdown (`mem::forget`) and reopened on the
//! same directory. Every tier must come back: live traces from the push log,
//! head files as completing blocks, completed blocks with their flush state.

#[path = "../common/mod.rs"]
mod common;

mod crash;
mod damage;
