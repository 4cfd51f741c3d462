//! Domain Layer - Broker session and streaming types.
//!
//! Pure types with no I/O. The session state is derived here from
//! persisted fields; every adapter and service builds on these.

/// Broker session lifecycle (credentials, state derivation, transitions).
pub mod session;

/// Realtime tick streaming types.
pub mod streaming;
