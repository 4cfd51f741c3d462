//! Application Layer - Use cases and port definitions.
//!
//! Services that orchestrate the session FSM, the broker gateway and the
//! tick streams, plus the port traits they are consumed through.

/// Port interfaces (credential store, broker API, session lifecycle, streaming).
pub mod ports;

/// Application services.
pub mod services;
