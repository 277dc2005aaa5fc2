//! Pattern-based bulk deletion against the remote tier.
//!
//! The scanner walks the keyspace with the cursor-driven scan primitive,
//! deletes matches in sub-batches and yields to the scheduler every few
//! batches so one large invalidation cannot starve other tasks. A time budget
//! bounds each pass; a pass that runs out of budget reports
//! `remaining: true` and a later call starts over from the beginning.

use std::time::Duration;

use chama_core::{CacheConfig, ChamaResult};
use tokio::time::Instant;
use tracing::{info, warn};

use super::glob::GlobPattern;
use super::traits::RemoteStore;

/// Outcome of an invalidation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Matching keys deleted in this pass. Keys the scan reports more than
    /// once are counted once.
    pub processed: u64,
    /// True if the pass stopped on its time budget before the scan finished.
    pub remaining: bool,
}

/// Budgeted, cooperative bulk deleter.
#[derive(Debug, Clone)]
pub struct InvalidationScanner {
    batch_size: usize,
    yield_every: usize,
}

impl InvalidationScanner {
    pub fn new(batch_size: usize, yield_every: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            yield_every: yield_every.max(1),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.scan_batch_size, config.scan_yield_every)
    }

    /// Delete every remote key matching `pattern` within `budget`.
    ///
    /// Transport errors abort the pass and propagate; keys already deleted
    /// stay deleted.
    pub async fn scan<R: RemoteStore + ?Sized>(
        &self,
        remote: &R,
        pattern: &GlobPattern,
        budget: Duration,
    ) -> ChamaResult<InvalidationReport> {
        let started = Instant::now();
        let native = pattern.to_native();
        let mut report = InvalidationReport::default();
        let mut cursor = 0u64;
        let mut batches = 0usize;

        loop {
            if started.elapsed() >= budget {
                report.remaining = true;
                break;
            }

            let (next, keys) = remote
                .scan(cursor, &native, self.batch_size)
                .await
                .inspect_err(|e| {
                    warn!(pattern = %pattern.as_str(), processed = report.processed, error = %e, "Invalidation scan aborted");
                })?;

            let mut chunks = keys.chunks(self.batch_size).peekable();
            while let Some(chunk) = chunks.next() {
                let removed = remote.delete(chunk).await.inspect_err(|e| {
                    warn!(pattern = %pattern.as_str(), processed = report.processed, error = %e, "Invalidation delete aborted");
                })?;
                report.processed += removed;
                batches += 1;

                if batches % self.yield_every == 0 {
                    tokio::task::yield_now().await;
                }
                let more = chunks.peek().is_some() || next != 0;
                if more && started.elapsed() >= budget {
                    report.remaining = true;
                    break;
                }
            }
            if report.remaining || next == 0 {
                break;
            }
            cursor = next;
        }

        info!(
            pattern = %pattern.as_str(),
            processed = report.processed,
            remaining = report.remaining,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Invalidation pass finished"
        );
        Ok(report)
    }
}
