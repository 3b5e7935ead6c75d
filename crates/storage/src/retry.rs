//! Retrying backend wrapper
//!
//! Wraps any [`StorageBackend`] and retries transient I/O failures with
//! exponential backoff. Only [`Error::is_retryable`] errors are retried;
//! cancellation of the caller's context stops retrying immediately.

use crate::backend::StorageBackend;
use backoff::{Error as BackoffError, ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use spanstore_core::{BlockId, Context, Error, Result};
use std::time::Duration;
use tracing::warn;

/// Retry settings for backend calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Attempts per call, including the first (0 = unlimited within `max_elapsed_ms`)
    pub max_attempts: u32,
    /// First retry delay
    pub initial_interval_ms: u64,
    /// Ceiling for a single delay
    pub max_interval_ms: u64,
    /// Give up after this long (0 = no time limit)
    pub max_elapsed_ms: u64,
    /// Delay growth factor
    pub multiplier: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval_ms: 50,
            max_interval_ms: 2_000,
            max_elapsed_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackendConfig {
    fn backoff(&self) -> ExponentialBackoff {
        let max_elapsed = match self.max_elapsed_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_interval_ms))
            .with_multiplier(self.multiplier)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_millis(self.max_interval_ms))
            .with_max_elapsed_time(max_elapsed)
            .build()
    }
}

/// [`StorageBackend`] that retries transient failures of the wrapped one.
#[derive(Debug)]
pub struct RetryingBackend<B> {
    inner: B,
    config: BackendConfig,
}

impl<B: StorageBackend> RetryingBackend<B> {
    /// Wrap `inner`.
    pub fn new(inner: B, config: BackendConfig) -> Self {
        Self { inner, config }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn retry<T>(
        &self,
        ctx: &Context,
        op_name: &str,
        mut op: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        let max_attempts = self.config.max_attempts;
        let result = backoff::retry_notify(
            self.config.backoff(),
            || {
                ctx.check().map_err(BackoffError::permanent)?;
                attempt += 1;
                match op() {
                    Ok(v) => Ok(v),
                    Err(e)
                        if e.is_retryable() && (max_attempts == 0 || attempt < max_attempts) =>
                    {
                        Err(BackoffError::transient(e))
                    }
                    Err(e) => Err(BackoffError::permanent(e)),
                }
            },
            |err: Error, delay: Duration| {
                warn!(
                    op = op_name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retrying backend call"
                );
            },
        );
        result.map_err(|e| match e {
            BackoffError::Permanent(err) => err,
            BackoffError::Transient { err, .. } => err,
        })
    }
}

impl<B: StorageBackend> StorageBackend for RetryingBackend<B> {
    fn read(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        self.retry(ctx, "read", || {
            self.inner.read(ctx, tenant, block, object, offset, buf)
        })
    }

    fn read_all(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
    ) -> Result<Vec<u8>> {
        self.retry(ctx, "read_all", || self.inner.read_all(ctx, tenant, block, object))
    }

    fn write(
        &self,
        ctx: &Context,
        tenant: &str,
        block: BlockId,
        object: &str,
        data: &[u8],
    ) -> Result<()> {
        self.retry(ctx, "write", || self.inner.write(ctx, tenant, block, object, data))
    }

    fn delete_block(&self, ctx: &Context, tenant: &str, block: BlockId) -> Result<()> {
        self.retry(ctx, "delete_block", || self.inner.delete_block(ctx, tenant, block))
    }

    fn list_blocks(&self, ctx: &Context, tenant: &str) -> Result<Vec<BlockId>> {
        self.retry(ctx, "list_blocks", || self.inner.list_blocks(ctx, tenant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DATA_OBJECT;
    use crate::memory::MemoryBackend;
    use spanstore_core::CancellationToken;

    fn fast() -> BackendConfig {
        BackendConfig {
            max_attempts: 4,
            initial_interval_ms: 1,
            max_interval_ms: 2,
            max_elapsed_ms: 0,
            multiplier: 1.5,
        }
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let backend = RetryingBackend::new(MemoryBackend::new(), fast());
        let ctx = Context::background();
        let block = BlockId::new();
        backend.write(&ctx, "t", block, DATA_OBJECT, b"payload").unwrap();

        backend.inner().fail_next_reads(3);
        assert_eq!(
            backend.read_all(&ctx, "t", block, DATA_OBJECT).unwrap(),
            b"payload"
        );
        assert_eq!(backend.inner().read_count(), 4);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let backend = RetryingBackend::new(MemoryBackend::new(), fast());
        let ctx = Context::background();
        let block = BlockId::new();
        backend.write(&ctx, "t", block, DATA_OBJECT, b"payload").unwrap();

        backend.inner().fail_next_reads(10);
        let err = backend.read_all(&ctx, "t", block, DATA_OBJECT).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.inner().read_count(), 4);
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let backend = RetryingBackend::new(MemoryBackend::new(), fast());
        let err = backend
            .read_all(&Context::background(), "t", BlockId::new(), DATA_OBJECT)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(backend.inner().read_count(), 1);
    }

    #[test]
    fn test_cancelled_context_stops_immediately() {
        let backend = RetryingBackend::new(MemoryBackend::new(), fast());
        let token = CancellationToken::new();
        token.cancel();
        let err = backend
            .read_all(&Context::with_token(token), "t", BlockId::new(), DATA_OBJECT)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(backend.inner().read_count(), 0);
    }
}
