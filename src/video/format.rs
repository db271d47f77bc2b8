//! Pixel formats and resolution of decoded frames

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layout of a decoded frame handed over by the frame sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// RGBA (4 bytes per pixel, as read back from a canvas)
    Rgba,
    /// Grayscale format
    Grey,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// YUV420 planar format
    Yuv420,
}

impl PixelFormat {
    /// Bytes per pixel for packed formats; luma bytes per pixel for planar ones
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Yuyv => 2,
            PixelFormat::Grey | PixelFormat::Nv12 | PixelFormat::Yuv420 => 1,
        }
    }

    /// Whether the first plane is a full-resolution luma plane
    pub fn is_planar_yuv(&self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::Yuv420)
    }

    /// Minimum buffer size for a frame with the given luma/packed stride
    pub fn frame_size(&self, resolution: Resolution, stride: usize) -> usize {
        let rows = resolution.height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420 => stride * rows * 3 / 2,
            _ => stride * rows,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Grey => "GREY",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Yuv420 => "YUV420",
        };
        write!(f, "{}", name)
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
