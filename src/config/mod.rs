//! Configuration: JSON-backed store with lock-free reads

pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, HeartbeatConfig, QualityConfig, ReconnectConfig, SessionConfig, SignalingConfig,
};
pub use store::{ConfigChange, ConfigStore};
