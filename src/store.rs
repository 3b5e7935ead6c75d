//! Main entry point for spanstore.
//!
//! This module provides the `SpanStore` struct, a tenant-aware handle over
//! the ingester that hides instance lookup and request contexts.

use spanstore_core::{Context, IngesterConfig, Overrides, Result, SyncMode, Trace};
use spanstore_engine::{Ingester, Instance, SweepStats};
use spanstore_search::{
    QueryCompiler, SearchRequest, SearchResponse, SearchTagValuesResponse,
    SearchTagValuesV2Response, SearchTagsResponse, SpanMetricsRequest, SpanMetricsResponse,
};
use spanstore_storage::StorageBackend;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// The span store.
///
/// Create a store using [`SpanStore::open`] or [`SpanStore::builder`].
/// Every read and write names its tenant; a tenant's instance is opened
/// (and recovered from disk) on first use.
///
/// # Example
///
/// ```ignore
/// use spanstore::prelude::*;
///
/// let store = SpanStore::open("./data")?;
/// store.start()?;
///
/// store.push("acme", &trace_id, &encode_fragment(&resource_spans)?)?;
/// let hits = store.search("acme", &SearchRequest::new().with_tag("http.method", "GET"))?;
///
/// store.close()?;
/// ```
pub struct SpanStore {
    ingester: Ingester,
}

impl SpanStore {
    /// Open a store rooted at `path` with default settings.
    ///
    /// Background workers are not running until [`SpanStore::start`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder().path(path).open()
    }

    /// Create a builder for store configuration.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SpanStore::builder()
    ///     .path("./data")
    ///     .sync_mode(SyncMode::EveryWrite)
    ///     .flush_backend(Arc::new(MemoryBackend::new()))
    ///     .open()?;
    /// ```
    pub fn builder() -> SpanStoreBuilder {
        SpanStoreBuilder::new()
    }

    /// Start the cut, complete and clear workers.
    pub fn start(&self) -> Result<()> {
        self.ingester.start()
    }

    /// Push one encoded fragment of trace `trace_id` for `tenant`.
    pub fn push(&self, tenant: &str, trace_id: &[u8], fragment: &[u8]) -> Result<()> {
        self.ingester.push(tenant, trace_id, fragment)
    }

    /// Search the traces of `tenant`.
    pub fn search(&self, tenant: &str, request: &SearchRequest) -> Result<SearchResponse> {
        self.instance(tenant)?.search(&self.context(), request)
    }

    /// Distinct tag names of `tenant` in `scope`.
    pub fn search_tags(&self, tenant: &str, scope: &str) -> Result<SearchTagsResponse> {
        self.instance(tenant)?.search_tags(&self.context(), scope)
    }

    /// Distinct values of `tag` for `tenant`.
    pub fn search_tag_values(&self, tenant: &str, tag: &str) -> Result<SearchTagValuesResponse> {
        self.instance(tenant)?
            .search_tag_values(&self.context(), tag)
    }

    /// Distinct typed values of `tag`, optionally over spans matching `query`.
    pub fn search_tag_values_v2(
        &self,
        tenant: &str,
        tag: &str,
        query: Option<&str>,
    ) -> Result<SearchTagValuesV2Response> {
        self.instance(tenant)?
            .search_tag_values_v2(&self.context(), tag, query)
    }

    /// Span duration metrics for `tenant`.
    pub fn span_metrics(
        &self,
        tenant: &str,
        request: &SpanMetricsRequest,
    ) -> Result<SpanMetricsResponse> {
        self.instance(tenant)?.span_metrics(&self.context(), request)
    }

    /// The full trace `trace_id`, merged across every tier.
    pub fn find_trace_by_id(&self, tenant: &str, trace_id: &[u8]) -> Result<Option<Trace>> {
        self.instance(tenant)?
            .find_trace_by_id(&self.context(), trace_id)
    }

    /// Force every buffered trace through to completed blocks.
    pub fn flush(&self) -> Result<SweepStats> {
        self.ingester.flush_all()
    }

    /// Stop the workers and cut live traces to disk.
    ///
    /// The store stays readable after `close()`.
    pub fn close(&self) -> Result<()> {
        self.ingester.stop()
    }

    /// Tenants with an open instance.
    pub fn tenants(&self) -> Vec<String> {
        self.ingester.tenants()
    }

    /// The instance of `tenant`, opening it if needed.
    pub fn instance(&self, tenant: &str) -> Result<Arc<Instance>> {
        self.ingester.get_or_create_instance(tenant)
    }

    /// The underlying ingester.
    pub fn ingester(&self) -> &Ingester {
        &self.ingester
    }

    /// Get the store's data directory.
    pub fn path(&self) -> &Path {
        &self.ingester.config().data_dir
    }

    fn context(&self) -> Context {
        Context::background().with_timeout(self.ingester.config().complete_block_timeout())
    }
}

/// Builder for store configuration.
///
/// Starts from [`IngesterConfig::default`]; [`SpanStoreBuilder::config`]
/// replaces it wholesale, the other setters adjust single fields.
pub struct SpanStoreBuilder {
    config: IngesterConfig,
    overrides: Option<Arc<dyn Overrides>>,
    compiler: Option<Arc<dyn QueryCompiler>>,
    flush_backend: Option<Arc<dyn StorageBackend>>,
    cache_bytes: Option<u64>,
}

impl SpanStoreBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: IngesterConfig::default(),
            overrides: None,
            compiler: None,
            flush_backend: None,
            cache_bytes: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: IngesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the data directory.
    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Push log sync policy.
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.wal.sync_mode = mode;
        self
    }

    /// Period of the background lifecycle checks.
    pub fn flush_check_period(mut self, period: Duration) -> Self {
        self.config.flush_check_period_ms = period.as_millis() as u64;
        self
    }

    /// Idle time after which a live trace is cut.
    pub fn max_trace_idle(mut self, idle: Duration) -> Self {
        self.config.max_trace_idle_ms = idle.as_millis() as u64;
        self
    }

    /// Per-tenant limits.
    pub fn overrides(mut self, overrides: Arc<dyn Overrides>) -> Self {
        self.overrides = Some(overrides);
        self
    }

    /// Query compiler for search and metrics queries.
    pub fn compiler(mut self, compiler: Arc<dyn QueryCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Backend completed blocks are flushed to.
    pub fn flush_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.flush_backend = Some(backend);
        self
    }

    /// Range cache size (0 disables it).
    pub fn cache_bytes(mut self, bytes: u64) -> Self {
        self.cache_bytes = Some(bytes);
        self
    }

    /// Open the store, recovering any tenants found on disk.
    pub fn open(self) -> Result<SpanStore> {
        let mut builder = Ingester::builder(self.config);
        if let Some(overrides) = self.overrides {
            builder = builder.overrides(overrides);
        }
        if let Some(compiler) = self.compiler {
            builder = builder.compiler(compiler);
        }
        if let Some(backend) = self.flush_backend {
            builder = builder.flush_backend(backend);
        }
        if let Some(bytes) = self.cache_bytes {
            builder = builder.cache_bytes(bytes);
        }
        Ok(SpanStore {
            ingester: builder.open()?,
        })
    }
}

impl Default for SpanStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}
