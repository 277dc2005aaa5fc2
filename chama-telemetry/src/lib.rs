//! Chama Telemetry - Observability Infrastructure
//!
//! Structured logging setup and Prometheus metrics for the cache layer.

pub mod metrics;
pub mod tracer;

pub use metrics::{encode_metrics, PrometheusCacheMetrics, CACHE_METRICS};
pub use tracer::{init_tracing, LogFormat, TelemetryConfig};
