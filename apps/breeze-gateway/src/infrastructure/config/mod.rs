//! Configuration Module
//!
//! Configuration loading for the gateway service.

mod settings;

pub use settings::{
    BrokerSettings, ConfigError, GatewayConfig, ServerSettings, SessionSettings, StreamSettings,
};
