//! camlink - resilient WebRTC link to a network camera
//!
//! This crate keeps a receive-only WebRTC session to a camera alive:
//! WebSocket signaling, SDP repair for broken answers, a frame quality
//! watchdog, heartbeat beacons and capped exponential reconnection.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
