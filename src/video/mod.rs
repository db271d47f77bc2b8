//! Decoded frame model shared by the quality monitor and the frame sink

pub mod format;
pub mod frame;

pub use format::{PixelFormat, Resolution};
pub use frame::{LumaPlane, VideoFrame};
