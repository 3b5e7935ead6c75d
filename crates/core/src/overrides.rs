//! Per-tenant limits
//!
//! [`Overrides`] is the seam through which an instance reads its tenant's
//! limits on every call, so a runtime reload is picked up without
//! restarting the instance. [`StaticOverrides`] is the in-process
//! implementation: defaults plus an optional per-tenant table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Limits applied to one tenant. `0` disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Max traces buffered in the live table
    pub max_live_traces: usize,
    /// Max accumulated fragment bytes per live trace
    pub max_bytes_per_trace: usize,
    /// Head block size that triggers a cut
    pub max_block_bytes: u64,
    /// Head block age that triggers a cut, in milliseconds
    pub max_block_duration_ms: u64,
    /// Byte budget for one tag names/values query
    pub max_bytes_per_tag_values_query: usize,
    /// Max blocks consulted by one tag names/values query
    pub max_blocks_per_tag_values_query: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_live_traces: 10_000,
            max_bytes_per_trace: 5 * 1024 * 1024,
            max_block_bytes: 0,
            max_block_duration_ms: 0,
            max_bytes_per_tag_values_query: 1024 * 1024,
            max_blocks_per_tag_values_query: 0,
        }
    }
}

impl Limits {
    /// Unlimited everything.
    pub fn unlimited() -> Self {
        Self {
            max_live_traces: 0,
            max_bytes_per_trace: 0,
            max_block_bytes: 0,
            max_block_duration_ms: 0,
            max_bytes_per_tag_values_query: 0,
            max_blocks_per_tag_values_query: 0,
        }
    }
}

/// Source of per-tenant limits.
pub trait Overrides: Send + Sync {
    /// Limits currently in force for `tenant`.
    fn limits(&self, tenant: &str) -> Limits;

    /// See [`Limits::max_live_traces`].
    fn max_live_traces(&self, tenant: &str) -> usize {
        self.limits(tenant).max_live_traces
    }

    /// See [`Limits::max_bytes_per_trace`].
    fn max_bytes_per_trace(&self, tenant: &str) -> usize {
        self.limits(tenant).max_bytes_per_trace
    }

    /// See [`Limits::max_block_bytes`].
    fn max_block_bytes(&self, tenant: &str) -> u64 {
        self.limits(tenant).max_block_bytes
    }

    /// See [`Limits::max_block_duration_ms`]. `None` when disabled.
    fn max_block_duration(&self, tenant: &str) -> Option<Duration> {
        match self.limits(tenant).max_block_duration_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// See [`Limits::max_bytes_per_tag_values_query`].
    fn max_bytes_per_tag_values_query(&self, tenant: &str) -> usize {
        self.limits(tenant).max_bytes_per_tag_values_query
    }

    /// See [`Limits::max_blocks_per_tag_values_query`].
    fn max_blocks_per_tag_values_query(&self, tenant: &str) -> usize {
        self.limits(tenant).max_blocks_per_tag_values_query
    }
}

/// Fixed defaults with optional per-tenant replacements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticOverrides {
    /// Limits for tenants without an entry
    pub defaults: Limits,
    /// Per-tenant limits
    pub per_tenant: HashMap<String, Limits>,
}

impl StaticOverrides {
    /// Same limits for every tenant.
    pub fn new(defaults: Limits) -> Self {
        Self {
            defaults,
            per_tenant: HashMap::new(),
        }
    }

    /// Replace the limits of one tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>, limits: Limits) -> Self {
        self.per_tenant.insert(tenant.into(), limits);
        self
    }
}

impl Overrides for StaticOverrides {
    fn limits(&self, tenant: &str) -> Limits {
        self.per_tenant
            .get(tenant)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}
