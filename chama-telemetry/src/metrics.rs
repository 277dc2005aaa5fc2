//! Prometheus Metrics for the Cache
//!
//! Registers the cache metrics with the default Prometheus registry and
//! implements the cache's metrics sink on top of them.

use chama_cache::{CacheMetrics, CacheOp, CacheOutcome};
use chama_core::{ChamaError, ChamaResult};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder};

/// Global metrics instance - registered once on first use
pub static CACHE_METRICS: Lazy<ChamaResult<PrometheusCacheMetrics>> =
    Lazy::new(PrometheusCacheMetrics::register);

/// Cache metrics backed by the default Prometheus registry.
#[derive(Clone)]
pub struct PrometheusCacheMetrics {
    /// Operation outcome counter - labels: operation, outcome
    pub operations_total: IntCounterVec,

    /// Entries currently held by the local tier
    pub local_items: IntGauge,

    /// Estimated bytes currently held by the local tier
    pub local_bytes: IntGauge,
}

impl PrometheusCacheMetrics {
    /// Handle to the process-wide metrics, registering them on first use.
    pub fn global() -> ChamaResult<Self> {
        CACHE_METRICS.as_ref().cloned().map_err(Clone::clone)
    }

    fn register() -> ChamaResult<Self> {
        Ok(Self {
            operations_total: register_int_counter_vec!(
                "chama_cache_operations_total",
                "Total cache operations by outcome",
                &["operation", "outcome"]
            )
            .map_err(|e| telemetry_error("chama_cache_operations_total", e))?,

            local_items: register_int_gauge!(
                "chama_cache_local_items",
                "Entries held by the local cache tier"
            )
            .map_err(|e| telemetry_error("chama_cache_local_items", e))?,

            local_bytes: register_int_gauge!(
                "chama_cache_local_bytes",
                "Estimated bytes held by the local cache tier"
            )
            .map_err(|e| telemetry_error("chama_cache_local_bytes", e))?,
        })
    }

    /// Current count for one operation/outcome pair.
    pub fn count(&self, op: CacheOp, outcome: CacheOutcome) -> u64 {
        self.operations_total
            .with_label_values(&[op.as_str(), outcome.as_str()])
            .get()
    }
}

impl CacheMetrics for PrometheusCacheMetrics {
    fn record(&self, op: CacheOp, outcome: CacheOutcome) {
        self.operations_total
            .with_label_values(&[op.as_str(), outcome.as_str()])
            .inc();
    }

    fn observe_local(&self, items: usize, bytes: usize) {
        self.local_items.set(i64::try_from(items).unwrap_or(i64::MAX));
        self.local_bytes.set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }
}

fn telemetry_error(metric: &str, e: prometheus::Error) -> ChamaError {
    ChamaError::Telemetry {
        reason: format!("Failed to register {}: {}", metric, e),
    }
}

/// Render every registered metric in the Prometheus text format.
pub fn encode_metrics() -> ChamaResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ChamaError::Telemetry {
            reason: format!("Failed to encode metrics: {}", e),
        })?;
    String::from_utf8(buffer).map_err(|e| ChamaError::Telemetry {
        reason: format!("Metrics output is not UTF-8: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chama_cache::{CacheManager, InMemoryRemoteStore};
    use chama_core::CacheConfig;
    use std::sync::Arc;

    #[test]
    fn test_global_handle_is_shared() -> Result<(), String> {
        let a = PrometheusCacheMetrics::global().map_err(|e| e.to_string())?;
        let b = PrometheusCacheMetrics::global().map_err(|e| e.to_string())?;
        let before = b.count(CacheOp::Delete, CacheOutcome::Deleted);
        a.record(CacheOp::Delete, CacheOutcome::Deleted);
        assert!(b.count(CacheOp::Delete, CacheOutcome::Deleted) > before);
        Ok(())
    }

    #[test]
    fn test_encode_contains_cache_metrics() -> Result<(), String> {
        let metrics = PrometheusCacheMetrics::global().map_err(|e| e.to_string())?;
        metrics.record(CacheOp::Invalidate, CacheOutcome::Error);
        metrics.observe_local(3, 4096);

        let text = encode_metrics().map_err(|e| e.to_string())?;
        assert!(text.contains("chama_cache_operations_total"));
        assert!(text.contains("operation=\"invalidate\""));
        assert!(text.contains("chama_cache_local_bytes"));
        Ok(())
    }

    #[tokio::test]
    async fn test_manager_reports_through_prometheus() -> Result<(), String> {
        let metrics = PrometheusCacheMetrics::global().map_err(|e| e.to_string())?;
        let hits_before = metrics.count(CacheOp::Get, CacheOutcome::HitLocal);
        let stored_before = metrics.count(CacheOp::Set, CacheOutcome::Stored);

        let cache = CacheManager::with_metrics(
            CacheConfig::default(),
            Arc::new(InMemoryRemoteStore::new()),
            Arc::new(metrics.clone()),
        )
        .map_err(|e| e.to_string())?;
        cache.set("chama:1:dashboard", &42u32, None).await;
        assert_eq!(cache.get::<u32>("chama:1:dashboard").await, Some(42));

        assert!(metrics.count(CacheOp::Get, CacheOutcome::HitLocal) > hits_before);
        assert!(metrics.count(CacheOp::Set, CacheOutcome::Stored) > stored_before);
        Ok(())
    }
}
