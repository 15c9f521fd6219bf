//! Live image buffers for the depth and color streams.
//!
//! Each slot is sized once from its stream descriptor and overwritten in place
//! on every accepted arrival. A rejected arrival leaves the previous contents
//! untouched.

use sensor_ingest::{
    COLOR_BYTES_PER_PIXEL, ColorFormat, DEPTH_BYTES_PER_PIXEL, FrameDescriptor,
};
use thiserror::Error;

use crate::{
    Stream,
    depth::{self, ReliabilityBounds},
};

/// Incoming buffer or descriptor disagrees with the slot's geometry.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error(
    "{stream} frame rejected: slot is {expected_width}x{expected_height}, \
     arrival is {width}x{height} at {bytes_per_pixel} B/px carrying {buffer_len} bytes"
)]
pub struct GeometryMismatch {
    pub stream: Stream,
    pub expected_width: u32,
    pub expected_height: u32,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub buffer_len: usize,
}

fn check_geometry(
    stream: Stream,
    slot: &FrameDescriptor,
    raw_len: usize,
    descriptor: &FrameDescriptor,
) -> Result<(), GeometryMismatch> {
    let mismatch = || GeometryMismatch {
        stream,
        expected_width: slot.width,
        expected_height: slot.height,
        width: descriptor.width,
        height: descriptor.height,
        bytes_per_pixel: descriptor.bytes_per_pixel,
        buffer_len: raw_len,
    };

    if descriptor.bytes_per_pixel != slot.bytes_per_pixel || !descriptor.same_plane(slot) {
        return Err(mismatch());
    }
    if raw_len / descriptor.bytes_per_pixel as usize != descriptor.pixel_count() {
        return Err(mismatch());
    }
    Ok(())
}

/// Intensity image derived from the depth stream, one byte per pixel.
#[derive(Debug)]
pub struct DepthSlot {
    descriptor: FrameDescriptor,
    pixels: Vec<u8>,
}

impl DepthSlot {
    pub fn new(width: u32, height: u32) -> Self {
        let descriptor = FrameDescriptor {
            width,
            height,
            bytes_per_pixel: DEPTH_BYTES_PER_PIXEL,
        };
        Self {
            pixels: vec![0; descriptor.pixel_count()],
            descriptor,
        }
    }

    /// Geometry of the raw depth frames this slot accepts.
    pub fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn check(&self, raw: &[u8], descriptor: &FrameDescriptor) -> Result<(), GeometryMismatch> {
        check_geometry(Stream::Depth, &self.descriptor, raw.len(), descriptor)
    }

    /// Validate `raw` and convert it into the intensity buffer.
    pub fn try_store(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        bounds: ReliabilityBounds,
    ) -> Result<(), GeometryMismatch> {
        self.check(raw, descriptor)?;
        depth::convert_le_bytes(raw, bounds, &mut self.pixels);
        Ok(())
    }

    pub fn validate_and_store(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        bounds: ReliabilityBounds,
    ) -> bool {
        self.try_store(raw, descriptor, bounds).is_ok()
    }
}

/// Packed BGRA image from the color stream.
#[derive(Debug)]
pub struct ColorSlot {
    descriptor: FrameDescriptor,
    pixels: Vec<u8>,
}

impl ColorSlot {
    pub fn new(width: u32, height: u32) -> Self {
        let descriptor = FrameDescriptor {
            width,
            height,
            bytes_per_pixel: COLOR_BYTES_PER_PIXEL,
        };
        Self {
            pixels: vec![0; descriptor.frame_len()],
            descriptor,
        }
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    /// BGRA bytes, four per pixel.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn check(&self, raw: &[u8], descriptor: &FrameDescriptor) -> Result<(), GeometryMismatch> {
        check_geometry(Stream::Color, &self.descriptor, raw.len(), descriptor)
    }

    /// Validate `raw` and copy it into the slot, swizzling RGBA input to BGRA.
    pub fn try_store(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        format: ColorFormat,
    ) -> Result<(), GeometryMismatch> {
        self.check(raw, descriptor)?;
        let len = self.pixels.len();
        match format {
            ColorFormat::Bgra8 => self.pixels.copy_from_slice(&raw[..len]),
            ColorFormat::Rgba8 => {
                for (dst, src) in self.pixels.chunks_exact_mut(4).zip(raw.chunks_exact(4)) {
                    dst.copy_from_slice(&[src[2], src[1], src[0], src[3]]);
                }
            }
        }
        Ok(())
    }

    pub fn validate_and_store(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        format: ColorFormat,
    ) -> bool {
        self.try_store(raw, descriptor, format).is_ok()
    }
}

/// Both live buffers, owned together until the streams are split apart.
#[derive(Debug)]
pub struct FrameStore {
    depth: DepthSlot,
    color: ColorSlot,
}

impl FrameStore {
    pub fn new(depth: &FrameDescriptor, color: &FrameDescriptor) -> Self {
        Self {
            depth: DepthSlot::new(depth.width, depth.height),
            color: ColorSlot::new(color.width, color.height),
        }
    }

    pub fn validate_and_store_depth(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        bounds: ReliabilityBounds,
    ) -> bool {
        self.depth.validate_and_store(raw, descriptor, bounds)
    }

    pub fn validate_and_store_color(
        &mut self,
        raw: &[u8],
        descriptor: &FrameDescriptor,
        format: ColorFormat,
    ) -> bool {
        self.color.validate_and_store(raw, descriptor, format)
    }

    pub fn depth(&self) -> &DepthSlot {
        &self.depth
    }

    pub fn color(&self) -> &ColorSlot {
        &self.color
    }

    /// Hand each slot to its own stream pipeline.
    pub fn into_slots(self) -> (DepthSlot, ColorSlot) {
        (self.depth, self.color)
    }
}
