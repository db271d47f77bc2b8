//! Decoded video frame as exposed by the frame sink

use bytes::Bytes;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::time::Instant;

use super::format::{PixelFormat, Resolution};

/// A decoded video frame with metadata
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw pixel data
    data: Arc<Bytes>,
    /// Cached xxHash64 of the pixel data
    hash: Arc<OnceLock<u64>>,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per row of the packed buffer or luma plane
    pub stride: u32,
    /// Frame sequence number
    pub sequence: u64,
    /// When the sink produced this frame
    pub received_at: Instant,
}

/// 8-bit luma plane, row-major without padding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LumaPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl VideoFrame {
    /// Create a frame; a zero `stride` means tightly packed rows
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        let stride = if stride == 0 {
            resolution.width * format.bytes_per_pixel() as u32
        } else {
            stride
        };
        Self {
            data: Arc::new(data),
            hash: Arc::new(OnceLock::new()),
            resolution,
            format,
            stride,
            sequence,
            received_at: Instant::now(),
        }
    }

    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self::new(Bytes::from(data), resolution, format, stride, sequence)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Buffer holds at least a full frame
    pub fn is_complete(&self) -> bool {
        !self.is_empty()
            && self.data.len()
                >= self
                    .format
                    .frame_size(self.resolution, self.stride as usize)
    }

    /// Hash of frame data (computed once, cached)
    pub fn get_hash(&self) -> u64 {
        *self
            .hash
            .get_or_init(|| xxhash_rust::xxh64::xxh64(self.data.as_ref(), 0))
    }

    /// BT.601 luma of one pixel
    pub fn luma_at(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        let row = y as usize * self.stride as usize;
        let x = x as usize;
        let data = self.data.as_ref();

        match self.format {
            PixelFormat::Grey | PixelFormat::Nv12 | PixelFormat::Yuv420 => {
                data.get(row + x).copied()
            }
            PixelFormat::Yuyv => data.get(row + x * 2).copied(),
            PixelFormat::Rgb24 => {
                let px = data.get(row + x * 3..row + x * 3 + 3)?;
                Some(rgb_luma(px[0], px[1], px[2]))
            }
            PixelFormat::Bgr24 => {
                let px = data.get(row + x * 3..row + x * 3 + 3)?;
                Some(rgb_luma(px[2], px[1], px[0]))
            }
            PixelFormat::Rgba => {
                let px = data.get(row + x * 4..row + x * 4 + 3)?;
                Some(rgb_luma(px[0], px[1], px[2]))
            }
        }
    }

    /// Luma downsampled to half width and half height (a quarter of the pixels)
    ///
    /// Each output pixel averages a 2x2 block. Returns `None` for truncated buffers.
    pub fn quarter_luma(&self) -> Option<LumaPlane> {
        if !self.is_complete() {
            return None;
        }
        let width = (self.resolution.width as usize / 2).max(1);
        let height = (self.resolution.height as usize / 2).max(1);
        let max_x = self.resolution.width - 1;
        let max_y = self.resolution.height - 1;

        let mut data = Vec::with_capacity(width * height);
        for oy in 0..height as u32 {
            for ox in 0..width as u32 {
                let (x0, y0) = ((ox * 2).min(max_x), (oy * 2).min(max_y));
                let (x1, y1) = ((x0 + 1).min(max_x), (y0 + 1).min(max_y));
                let sum = self.luma_at(x0, y0)? as u32
                    + self.luma_at(x1, y0)? as u32
                    + self.luma_at(x0, y1)? as u32
                    + self.luma_at(x1, y1)? as u32;
                data.push((sum / 4) as u8);
            }
        }

        Some(LumaPlane {
            width,
            height,
            data,
        })
    }
}

#[inline]
fn rgb_luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}
