//! Chama Core - Shared Types
//!
//! Error taxonomy, configuration, circuit state and health types used by the
//! cache crates. This crate contains no I/O.

pub mod circuit;
pub mod config;
pub mod constants;
pub mod error;
pub mod health;

pub use circuit::CircuitState;
pub use config::{CacheConfig, CircuitBreakerConfig, RemoteConfig, TtlOverride};
pub use error::{ChamaError, ChamaResult, ConfigError, TransportError, ValidationError};
pub use health::{HealthCheck, HealthStatus};

use uuid::Uuid;

/// Identifier of a chama (savings group), the tenant unit of the backend.
pub type ChamaId = Uuid;
