//! ICICI Direct Breeze adapters.
//!
//! REST signing and transport plus the realtime feed's codec, heartbeat and
//! reconnect policy.

pub mod checksum;
pub mod codec;
pub mod heartbeat;
pub mod http_client;
pub mod reconnect;

pub use checksum::{ChecksumSigner, Signature, calculate_checksum};
pub use codec::{BrokerMethod, ControlAction, ControlFrame, InboundFrame};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use http_client::{BreezeHttpClient, BreezeHttpConfig, RequestAuth};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
