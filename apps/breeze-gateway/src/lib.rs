#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Breeze Gateway - Broker Session and Request Gateway
//!
//! Owns each user's connection to the ICICI Direct Breeze API: the session
//! lifecycle, every signed REST call and the per-user realtime tick feed.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: session and streaming types
//!   - `session`: credentials, derived session state, transition table
//!   - `streaming`: instrument keys, ticks, stream state
//!
//! - **Application**: ports and services
//!   - `ports`: credential store, broker API, session lifecycle, tick streaming
//!   - `services`: session FSM, broker gateway, login, stream manager
//!
//! - **Infrastructure**: adapters and cross-cutting concerns
//!   - `breeze`: checksum signing, REST transport, feed codec, heartbeat
//!   - `resilience`: rate limiter, retry policy, circuit breaker
//!   - `cache` / `persistence`: session cache and credential store
//!   - `config`, `telemetry`, `metrics`, `http`
//!
//! # Request Flow
//!
//! ```text
//! route guard ─► RateLimiter ─► SessionCache/CredentialStore ─► ChecksumSigner
//!                                                                   │
//!            Breeze REST ◄─ RetryPolicy ◄─ CircuitBreaker ◄──────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Session and streaming types with no I/O.
pub mod domain;

/// Application layer - Ports and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

/// Error taxonomy.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::session::{BrokerCredentials, BrokerSession, SessionState, UserId, derive_state};
pub use domain::streaming::{InstrumentKey, StreamState, Tick};

// Errors
pub use error::{ErrorKind, GatewayError, GatewayResult};

// Ports
pub use application::ports::{
    BrokerApi, CredentialStore, SessionLifecycle, TickSink, TickStreaming, TransitionOptions,
};

// Services
pub use application::services::{
    BrokerGateway, LoginService, RealtimeStreamManager, SessionFsm, SessionFsmConfig,
    SessionRepository, StreamManagerConfig, TickSubscription,
};

// Infrastructure
pub use infrastructure::breeze::{BrokerMethod, calculate_checksum};
pub use infrastructure::cache::SessionCache;
pub use infrastructure::config::{ConfigError, GatewayConfig};
pub use infrastructure::metrics::init_metrics;
pub use infrastructure::persistence::InMemoryCredentialStore;
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
