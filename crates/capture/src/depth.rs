//! Depth-to-intensity mapping.
//!
//! Raw depth arrives as millimetres in little-endian `u16`. Reliable samples are
//! divided by a fixed scale so roughly 0..8000 mm covers the byte range;
//! everything outside the reliable window becomes black.

/// Millimetres per intensity step.
pub const DEPTH_TO_BYTE: u16 = 8000 / 256;

/// Inclusive depth window treated as trustworthy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReliabilityBounds {
    pub min: u16,
    pub max: u16,
}

impl ReliabilityBounds {
    pub const fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    /// Everything from `min` up to the largest representable depth.
    pub const fn from_min(min: u16) -> Self {
        Self { min, max: u16::MAX }
    }

    pub const fn contains(&self, sample: u16) -> bool {
        self.min <= sample && sample <= self.max
    }
}

/// Intensity for a single sample.
///
/// Quotients above 255 wrap, matching a plain byte cast of the scaled value.
#[inline]
pub fn intensity(sample: u16, bounds: ReliabilityBounds) -> u8 {
    if bounds.contains(sample) {
        (sample / DEPTH_TO_BYTE) as u8
    } else {
        0
    }
}

/// Map little-endian sample pairs from a raw buffer into `out`, one byte per sample.
///
/// Callers validate that both slices describe the same frame; only the common
/// prefix is touched otherwise. A trailing odd byte is ignored.
pub fn convert_le_bytes(raw: &[u8], bounds: ReliabilityBounds, out: &mut [u8]) {
    for (dst, pair) in out.iter_mut().zip(raw.chunks_exact(2)) {
        *dst = intensity(u16::from_le_bytes([pair[0], pair[1]]), bounds);
    }
}
