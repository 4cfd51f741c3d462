//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SessionRepository`: cache-fronted access to session rows
//! - `SessionFsm`: derived state, transitions and the request guard
//! - `BrokerGateway`: rate-limited, signed, resilient broker calls
//! - `LoginService`: credential storage and the login handshake
//! - `RealtimeStreamManager`: one tick socket per user

pub mod gateway;
pub mod login;
pub mod session_fsm;
pub mod session_repository;
pub mod stream_manager;

pub use gateway::BrokerGateway;
pub use login::LoginService;
pub use session_fsm::{SessionFsm, SessionFsmConfig};
pub use session_repository::SessionRepository;
pub use stream_manager::{RealtimeStreamManager, StreamManagerConfig, TickSubscription};
