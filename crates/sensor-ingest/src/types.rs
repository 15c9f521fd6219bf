use std::io;

use anyhow::Error;
use thiserror::Error;

use crate::lease::LeasedBuffer;

/// Bytes per pixel of a raw depth sample (little-endian `u16`).
pub const DEPTH_BYTES_PER_PIXEL: u32 = 2;
/// Bytes per pixel of a packed four channel color sample.
pub const COLOR_BYTES_PER_PIXEL: u32 = 4;

/// Geometry advertised by a stream when it is opened.
///
/// A descriptor never changes for the lifetime of a stream; every buffer that
/// arrives on the stream is checked against it before it is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
}

impl FrameDescriptor {
    /// Build a descriptor, rejecting any zero dimension.
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Result<Self, SensorError> {
        if width == 0 || height == 0 || bytes_per_pixel == 0 {
            return Err(SensorError::InvalidGeometry {
                width,
                height,
                bytes_per_pixel,
            });
        }
        Ok(Self {
            width,
            height,
            bytes_per_pixel,
        })
    }

    /// Descriptor for a 16-bit depth stream.
    pub fn depth(width: u32, height: u32) -> Result<Self, SensorError> {
        Self::new(width, height, DEPTH_BYTES_PER_PIXEL)
    }

    /// Descriptor for a packed BGRA/RGBA color stream.
    pub fn color(width: u32, height: u32) -> Result<Self, SensorError> {
        Self::new(width, height, COLOR_BYTES_PER_PIXEL)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size in bytes of one raw frame with this geometry.
    pub fn frame_len(&self) -> usize {
        self.pixel_count() * self.bytes_per_pixel as usize
    }

    /// Whether two descriptors describe the same image plane, ignoring pixel depth.
    pub fn same_plane(&self, other: &FrameDescriptor) -> bool {
        self.width == other.width && self.height == other.height
    }
}

/// Channel order of a raw color buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColorFormat {
    Bgra8,
    Rgba8,
}

/// Raw depth frame as delivered by a sensor.
pub struct DepthFrame {
    /// Little-endian `u16` samples, leased from the sensor's buffer pool.
    pub buffer: LeasedBuffer,
    pub descriptor: FrameDescriptor,
    /// Minimum distance the sensor reports as reliable for this frame.
    pub min_reliable: u16,
    pub timestamp_ms: i64,
}

/// Raw color frame as delivered by a sensor.
pub struct ColorFrame {
    pub buffer: LeasedBuffer,
    pub descriptor: FrameDescriptor,
    pub format: ColorFormat,
    pub timestamp_ms: i64,
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor {name:?} unavailable: {reason}")]
    Unavailable { name: String, reason: String },
    #[error("invalid frame geometry {width}x{height} at {bytes_per_pixel} bytes per pixel")]
    InvalidGeometry {
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    },
    #[error("{0} stream disconnected")]
    Disconnected(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] Error),
}

impl SensorError {
    /// Whether the stream that produced this error will deliver no more frames.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SensorError::Disconnected(_) | SensorError::Unavailable { .. }
        )
    }
}
