//! Tenant Limits Integration Tests
//!
//! Per-tenant overrides applied on push and to tag queries.

#[path = "../common/mod.rs"]
mod common;

mod overrides;
