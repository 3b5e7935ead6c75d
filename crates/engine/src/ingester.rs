//! Multi-tenant ingester and its periodic workers
//!
//! The [`Ingester`] owns one [`Instance`] per tenant and drives the block
//! lifecycle. [`Ingester::sweep`] runs every step once, in order:
//!
//! ```text
//! cut idle live traces -> cut ready head -> complete + clear completing
//!   -> flush completed -> clear flushed past grace
//! ```
//!
//! [`Ingester::start`] runs the same steps on named background threads:
//! - `spanstore-cutter`: trace cut and block-ready check
//! - `spanstore-completer`: complete, clear completing, flush
//! - `spanstore-flush-clearer`: clear flushed blocks
//!
//! Each loop waits `flush_check_period` on a shared stop signal between
//! passes. [`Ingester::stop`] raises the signal, joins the threads and cuts
//! every live trace into its head so nothing is left only in the push log.

use crate::instance::Instance;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use spanstore_core::{Context, Error, IngesterConfig, Limits, Overrides, Result, StaticOverrides};
use spanstore_search::{ConjunctionCompiler, QueryCompiler};
use spanstore_storage::{RangeCache, StorageBackend};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default size of the shared range cache.
pub const DEFAULT_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Work done by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Live traces moved to head blocks
    pub traces_cut: usize,
    /// Head blocks sealed
    pub blocks_cut: usize,
    /// Blocks completed
    pub blocks_completed: usize,
    /// Blocks written to the flush backend
    pub blocks_flushed: usize,
    /// Flushed blocks removed locally
    pub blocks_cleared: usize,
    /// Steps that failed (logged)
    pub errors: usize,
}

/// Stop flag the worker loops sleep on.
#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`. Returns true once stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.cond.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

struct Shared {
    config: Arc<IngesterConfig>,
    overrides: Arc<dyn Overrides>,
    compiler: Arc<dyn QueryCompiler>,
    flush_backend: Option<Arc<dyn StorageBackend>>,
    cache: Option<Arc<RangeCache>>,
    instances: DashMap<String, Arc<Instance>>,
    create_lock: Mutex<()>,
    stop: StopSignal,
}

impl Shared {
    fn instances(&self) -> Vec<Arc<Instance>> {
        self.instances.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn cut(&self, instance: &Instance, force: bool, stats: &mut SweepStats) {
        let idle = if force {
            Duration::ZERO
        } else {
            self.config.max_trace_idle()
        };
        match instance.cut_complete_traces(idle, force) {
            Ok(n) => stats.traces_cut += n,
            Err(e) => {
                warn!(tenant = instance.tenant(), error = %e, "failed to cut live traces");
                stats.errors += 1;
            }
        }
        match instance.cut_block_if_ready(
            instance.max_block_bytes(),
            self.config.max_block_traces,
            force,
        ) {
            Ok(Some(_)) => stats.blocks_cut += 1,
            Ok(None) => {}
            Err(e) => {
                warn!(tenant = instance.tenant(), error = %e, "failed to cut head block");
                stats.errors += 1;
            }
        }
    }

    fn complete_and_flush(&self, instance: &Instance, stats: &mut SweepStats) {
        for block_id in instance.completing_block_ids() {
            if self.stop.is_stopped() {
                return;
            }
            let ctx = Context::background().with_timeout(self.config.complete_block_timeout());
            let completed = instance
                .complete_block(&ctx, block_id)
                .and_then(|()| instance.clear_completing_block(block_id));
            match completed {
                Ok(()) => stats.blocks_completed += 1,
                Err(e) => {
                    warn!(
                        tenant = instance.tenant(),
                        block_id = %block_id,
                        error = %e,
                        "failed to complete block"
                    );
                    stats.errors += 1;
                }
            }
        }

        let Some(backend) = &self.flush_backend else {
            return;
        };
        for block in instance.blocks_to_flush() {
            let ctx = Context::background().with_timeout(self.config.complete_block_timeout());
            let flushed = block
                .read_data(&ctx)
                .and_then(|data| backend.write_block(&ctx, block.meta(), &data))
                .and_then(|()| block.mark_flushed(&ctx));
            match flushed {
                Ok(()) => {
                    stats.blocks_flushed += 1;
                    info!(
                        tenant = instance.tenant(),
                        block_id = %block.block_id(),
                        "flushed block"
                    );
                }
                Err(e) => {
                    warn!(
                        tenant = instance.tenant(),
                        block_id = %block.block_id(),
                        error = %e,
                        "failed to flush block"
                    );
                    stats.errors += 1;
                }
            }
        }
    }

    fn clear_flushed(&self, instance: &Instance, stats: &mut SweepStats) {
        let ctx = Context::background();
        match instance.clear_flushed_blocks(&ctx, self.config.flush_grace_period()) {
            Ok(n) => stats.blocks_cleared += n,
            Err(e) => {
                warn!(tenant = instance.tenant(), error = %e, "failed to clear flushed blocks");
                stats.errors += 1;
            }
        }
    }

    fn sweep(&self, force: bool) -> SweepStats {
        let mut stats = SweepStats::default();
        for instance in self.instances() {
            self.cut(&instance, force, &mut stats);
            self.complete_and_flush(&instance, &mut stats);
            self.clear_flushed(&instance, &mut stats);
        }
        stats
    }
}

/// Builder for [`Ingester`].
pub struct IngesterBuilder {
    config: IngesterConfig,
    overrides: Arc<dyn Overrides>,
    compiler: Arc<dyn QueryCompiler>,
    flush_backend: Option<Arc<dyn StorageBackend>>,
    cache_bytes: u64,
}

impl IngesterBuilder {
    /// Builder with default limits, the conjunction query compiler, no
    /// flush backend and a 64 MiB range cache.
    pub fn new(config: IngesterConfig) -> Self {
        Self {
            config,
            overrides: Arc::new(StaticOverrides::new(Limits::default())),
            compiler: Arc::new(ConjunctionCompiler),
            flush_backend: None,
            cache_bytes: DEFAULT_CACHE_BYTES,
        }
    }

    /// Per-tenant limits.
    pub fn overrides(mut self, overrides: Arc<dyn Overrides>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Query compiler used by searches.
    pub fn compiler(mut self, compiler: Arc<dyn QueryCompiler>) -> Self {
        self.compiler = compiler;
        self
    }

    /// Backend completed blocks are flushed to.
    pub fn flush_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.flush_backend = Some(backend);
        self
    }

    /// Range cache size in bytes (0 disables the cache).
    pub fn cache_bytes(mut self, bytes: u64) -> Self {
        self.cache_bytes = bytes;
        self
    }

    /// Validate the config and recover every tenant found on disk.
    pub fn open(self) -> Result<Ingester> {
        self.config.validate()?;
        for warning in self.config.check() {
            warn!(explain = %warning.explain, "config: {}", warning.message);
        }
        let cache = (self.cache_bytes > 0).then(|| Arc::new(RangeCache::new(self.cache_bytes)));
        let shared = Arc::new(Shared {
            config: Arc::new(self.config),
            overrides: self.overrides,
            compiler: self.compiler,
            flush_backend: self.flush_backend,
            cache,
            instances: DashMap::new(),
            create_lock: Mutex::new(()),
            stop: StopSignal::default(),
        });

        let mut tenants = tenant_dirs(&shared.config.wal_dir())?;
        tenants.extend(tenant_dirs(&shared.config.blocks_dir())?);
        tenants.sort();
        tenants.dedup();

        let ingester = Ingester {
            shared,
            workers: Mutex::new(Vec::new()),
        };
        for tenant in &tenants {
            ingester.get_or_create_instance(tenant)?;
        }
        info!(
            data_dir = %ingester.shared.config.data_dir.display(),
            tenants = tenants.len(),
            "ingester opened"
        );
        Ok(ingester)
    }
}

/// Owns the tenant instances and the lifecycle workers.
pub struct Ingester {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Ingester {
    /// Open with default limits and compiler.
    pub fn open(config: IngesterConfig) -> Result<Self> {
        IngesterBuilder::new(config).open()
    }

    /// Builder for a customised ingester.
    pub fn builder(config: IngesterConfig) -> IngesterBuilder {
        IngesterBuilder::new(config)
    }

    /// Configuration in force.
    pub fn config(&self) -> &IngesterConfig {
        &self.shared.config
    }

    /// The instance of `tenant`, opening (and recovering) it if needed.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if `tenant` is not a valid tenant id.
    pub fn get_or_create_instance(&self, tenant: &str) -> Result<Arc<Instance>> {
        if let Some(instance) = self.instance(tenant) {
            return Ok(instance);
        }
        validate_tenant(tenant)?;
        let _create = self.shared.create_lock.lock();
        if let Some(instance) = self.instance(tenant) {
            return Ok(instance);
        }
        let instance = Arc::new(Instance::open(
            tenant,
            Arc::clone(&self.shared.config),
            Arc::clone(&self.shared.overrides),
            Arc::clone(&self.shared.compiler),
            self.shared.cache.clone(),
        )?);
        self.shared
            .instances
            .insert(tenant.to_string(), Arc::clone(&instance));
        debug!(tenant, "opened instance");
        Ok(instance)
    }

    /// The instance of `tenant`, if open.
    pub fn instance(&self, tenant: &str) -> Option<Arc<Instance>> {
        self.shared.instances.get(tenant).map(|e| Arc::clone(e.value()))
    }

    /// Tenants with an open instance, sorted.
    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> =
            self.shared.instances.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    /// Push one fragment for `tenant`.
    pub fn push(&self, tenant: &str, trace_id: &[u8], payload: &[u8]) -> Result<()> {
        self.get_or_create_instance(tenant)?.push(trace_id, payload)
    }

    /// Run every lifecycle step once for every tenant. With `force`, all
    /// live traces and non-empty heads are cut regardless of thresholds.
    pub fn sweep(&self, force: bool) -> SweepStats {
        let stats = self.shared.sweep(force);
        debug!(?stats, force, "sweep complete");
        stats
    }

    /// Force every live trace through to a completed (and, with a flush
    /// backend, flushed) block.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if any step failed; details are logged.
    pub fn flush_all(&self) -> Result<SweepStats> {
        let stats = self.sweep(true);
        if stats.errors > 0 {
            return Err(Error::InvalidState(format!(
                "{} lifecycle steps failed during flush",
                stats.errors
            )));
        }
        Ok(stats)
    }

    /// Start the background workers.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if already started or stopped
    /// - [`Error::Io`] if a thread cannot be spawned
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() || self.shared.stop.is_stopped() {
            return Err(Error::InvalidState("ingester workers already started".to_string()));
        }
        let period = self.shared.config.flush_check_period();

        workers.push(spawn_worker("spanstore-cutter", &self.shared, period, |shared| {
            let mut stats = SweepStats::default();
            for instance in shared.instances() {
                shared.cut(&instance, false, &mut stats);
            }
        })?);
        workers.push(spawn_worker("spanstore-completer", &self.shared, period, |shared| {
            let mut stats = SweepStats::default();
            for instance in shared.instances() {
                shared.complete_and_flush(&instance, &mut stats);
            }
        })?);
        workers.push(spawn_worker("spanstore-flush-clearer", &self.shared, period, |shared| {
            let mut stats = SweepStats::default();
            for instance in shared.instances() {
                shared.clear_flushed(&instance, &mut stats);
            }
        })?);
        info!(period_ms = period.as_millis() as u64, "ingester workers started");
        Ok(())
    }

    /// Stop the workers and cut every live trace into its head block.
    pub fn stop(&self) -> Result<()> {
        self.shared.stop.stop();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!(worker = %name, "ingester worker panicked");
            }
        }

        let mut first_error = None;
        for instance in self.shared.instances() {
            if let Err(e) = instance.cut_complete_traces(Duration::ZERO, true) {
                warn!(tenant = instance.tenant(), error = %e, "failed to cut live traces on stop");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Ingester {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "ingester stop failed during drop");
        }
    }
}

fn spawn_worker(
    name: &str,
    shared: &Arc<Shared>,
    period: Duration,
    work: fn(&Shared),
) -> Result<JoinHandle<()>> {
    let shared = Arc::clone(shared);
    let label = name.to_string();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!(worker = %label, "worker started");
            while !shared.stop.wait(period) {
                work(&shared);
            }
            debug!(worker = %label, "worker stopped");
        })
        .map_err(Error::Io)
}

/// Tenant ids are used as directory names.
fn validate_tenant(tenant: &str) -> Result<()> {
    let valid = !tenant.is_empty()
        && tenant.len() <= 150
        && tenant != "."
        && tenant != ".."
        && tenant
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid tenant id {:?}", tenant)))
    }
}

fn tenant_dirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::Io(e)),
    };
    let mut tenants = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if validate_tenant(name).is_ok() {
                tenants.push(name.to_string());
            }
        }
    }
    Ok(tenants)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanstore_core::{encode_fragment, Resource, ResourceSpans, ScopeSpans, Span, SyncMode};
    use spanstore_search::SearchRequest;
    use spanstore_storage::MemoryBackend;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> IngesterConfig {
        let mut config = IngesterConfig::with_data_dir(dir.path());
        config.wal.sync_mode = SyncMode::NoSync;
        config.flush_check_period_ms = 10;
        config.flush_grace_period_ms = 0;
        config.max_trace_idle_ms = 0;
        config
    }

    fn fragment(name: &str) -> Vec<u8> {
        let rs = ResourceSpans {
            resource: Resource {
                service_name: "api".into(),
                attrs: vec![],
            },
            scope_spans: vec![ScopeSpans {
                spans: vec![Span {
                    span_id: vec![1; 8],
                    name: name.into(),
                    start_time_unix_nano: 1,
                    end_time_unix_nano: 2,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        encode_fragment(&[rs]).unwrap()
    }

    #[test]
    fn test_tenant_validation() {
        assert!(validate_tenant("acme-prod_1").is_ok());
        for bad in ["", ".", "..", "a/b", "a b"] {
            assert!(validate_tenant(bad).unwrap_err().is_validation(), "{:?}", bad);
        }
        let dir = TempDir::new().unwrap();
        let ingester = Ingester::open(config(&dir)).unwrap();
        assert!(ingester.push("../etc", &[1], &fragment("a")).is_err());
        assert!(ingester.tenants().is_empty());
    }

    #[test]
    fn test_flush_all_moves_everything_to_the_backend() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        let ingester = Ingester::builder(config(&dir))
            .flush_backend(backend.clone())
            .open()
            .unwrap();
        ingester.push("acme", &[1], &fragment("a")).unwrap();
        ingester.push("globex", &[2], &fragment("b")).unwrap();

        let stats = ingester.flush_all().unwrap();
        assert_eq!(stats.traces_cut, 2);
        assert_eq!(stats.blocks_cut, 2);
        assert_eq!(stats.blocks_completed, 2);
        assert_eq!(stats.blocks_flushed, 2);
        assert_eq!(stats.blocks_cleared, 2);
        assert_eq!(backend.object_count(), 4);

        let acme = ingester.instance("acme").unwrap();
        assert!(acme.completed_block_ids().is_empty());
        assert!(acme.completing_block_ids().is_empty());
    }

    #[test]
    fn test_reopen_recovers_tenants() {
        let dir = TempDir::new().unwrap();
        {
            let ingester = Ingester::open(config(&dir)).unwrap();
            ingester.push("acme", &[1], &fragment("a")).unwrap();
        }
        let ingester = Ingester::open(config(&dir)).unwrap();
        assert_eq!(ingester.tenants(), vec!["acme".to_string()]);
        let response = ingester
            .instance("acme")
            .unwrap()
            .search(&Context::background(), &SearchRequest::new())
            .unwrap();
        assert_eq!(response.traces.len(), 1);
    }

    #[test]
    fn test_workers_cut_in_background() {
        let dir = TempDir::new().unwrap();
        let ingester = Ingester::open(config(&dir)).unwrap();
        ingester.push("acme", &[1], &fragment("a")).unwrap();
        ingester.start().unwrap();
        assert!(ingester.start().is_err());

        let acme = ingester.instance("acme").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while acme.live_count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(acme.live_count(), 0);
        ingester.stop().unwrap();
        ingester.stop().unwrap();
    }
}
