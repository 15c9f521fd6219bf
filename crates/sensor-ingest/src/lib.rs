//! Sensor sources delivering raw depth and color frames.
//!
//! A [`Sensor`] is opened once and hands back one bounded channel per stream.
//! Frames carry a [`LeasedBuffer`] that returns to the source's pool when the
//! consumer drops it.

pub mod lease;
pub mod pipe;
pub mod synthetic;
pub mod types;

use crossbeam_channel::Receiver;

pub use lease::{BufferPool, LeasedBuffer};
pub use pipe::{PipeSensor, PipeStream};
pub use synthetic::{SyntheticConfig, SyntheticSensor};
pub use types::{
    COLOR_BYTES_PER_PIXEL, ColorFormat, ColorFrame, DEPTH_BYTES_PER_PIXEL, DepthFrame,
    FrameDescriptor, SensorError,
};

/// Per-stream channels and geometry returned by [`Sensor::open`].
pub struct SensorStreams {
    pub depth: Receiver<Result<DepthFrame, SensorError>>,
    pub color: Receiver<Result<ColorFrame, SensorError>>,
    pub depth_descriptor: FrameDescriptor,
    pub color_descriptor: FrameDescriptor,
}

/// Device lifecycle consumed by the capture pipeline.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// Start streaming. Failing here is fatal to the caller's startup.
    fn open(&mut self) -> Result<SensorStreams, SensorError>;

    /// Stop producing frames and release device resources.
    fn close(&mut self);
}
