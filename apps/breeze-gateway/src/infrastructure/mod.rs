//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus cross-cutting concerns.

/// ICICI Direct Breeze adapters (signing, REST transport, feed codec).
pub mod breeze;

/// TTL session cache in front of the credential store.
pub mod cache;

/// Configuration loading.
pub mod config;

/// HTTP surface (health, metrics, guarded routes).
pub mod http;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Credential store adapters.
pub mod persistence;

/// Rate limiting, retry and circuit breaking.
pub mod resilience;

/// OpenTelemetry tracing integration.
pub mod telemetry;
