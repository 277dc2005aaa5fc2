//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! JSON formatter (production) or a human-readable one (development).

use chama_core::{ChamaError, ChamaResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "chama_cache=debug,info";

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "pretty" | "text" => Some(Self::Pretty),
            _ => None,
        }
    }
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Environment (production, staging, development)
    pub environment: String,
    /// Log line format
    pub log_format: LogFormat,
    /// Filter directives used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "chama-backend".to_string(),
            environment: "development".to_string(),
            log_format: LogFormat::Json,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read `CHAMA_SERVICE_NAME`, `CHAMA_ENVIRONMENT`, `CHAMA_LOG_FORMAT`
    /// (`json` or `pretty`) and `CHAMA_LOG`. Unset or unparseable values keep
    /// their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_name: std::env::var("CHAMA_SERVICE_NAME").unwrap_or(defaults.service_name),
            environment: std::env::var("CHAMA_ENVIRONMENT").unwrap_or(defaults.environment),
            log_format: std::env::var("CHAMA_LOG_FORMAT")
                .ok()
                .and_then(|raw| LogFormat::parse(&raw))
                .unwrap_or(defaults.log_format),
            filter: std::env::var("CHAMA_LOG").unwrap_or(defaults.filter),
        }
    }

    /// `RUST_LOG` wins over the configured directives.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.filter))
    }
}

/// Install the global tracing subscriber.
///
/// Call once at startup. A second call fails with `ChamaError::Telemetry`
/// because a global subscriber is already set.
pub fn init_tracing(config: &TelemetryConfig) -> ChamaResult<()> {
    let registry = tracing_subscriber::registry().with(config.env_filter());
    let installed = match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    installed.map_err(|e| ChamaError::Telemetry {
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        log_format = ?config.log_format,
        "Telemetry initialized"
    );
    Ok(())
}
