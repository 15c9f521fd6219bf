//! In-process sensor producing deterministic depth ramps and color bars.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::{SendTimeoutError, Sender, bounded};
use tracing::trace;

use crate::{
    Sensor, SensorStreams,
    lease::BufferPool,
    types::{ColorFormat, ColorFrame, DepthFrame, FrameDescriptor, SensorError},
};

/// Depth (in millimetres) at which the synthetic ramp wraps around.
const RAMP_SPAN_MM: u64 = 8_000;
/// How long a producer waits on a full channel before discarding the frame.
const SEND_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub depth: FrameDescriptor,
    pub color: FrameDescriptor,
    pub fps: f64,
    /// Minimum reliable distance reported with every depth frame.
    pub min_reliable: u16,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            depth: FrameDescriptor {
                width: 512,
                height: 424,
                bytes_per_pixel: 2,
            },
            color: FrameDescriptor {
                width: 640,
                height: 480,
                bytes_per_pixel: 4,
            },
            fps: 30.0,
            min_reliable: 500,
        }
    }
}

/// Sensor that fabricates frames on two background threads.
///
/// Channels are kept small so a slow consumer drops frames at the source
/// instead of queueing them.
pub struct SyntheticSensor {
    config: SyntheticConfig,
    running: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl SyntheticSensor {
    pub fn new(config: SyntheticConfig) -> Result<Self, SensorError> {
        if !(config.fps.is_finite() && config.fps > 0.0) {
            return Err(SensorError::Unavailable {
                name: "synthetic".into(),
                reason: format!("frame rate must be positive, got {}", config.fps),
            });
        }
        FrameDescriptor::depth(config.depth.width, config.depth.height)?;
        FrameDescriptor::color(config.color.width, config.color.height)?;
        Ok(Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }
}

impl Sensor for SyntheticSensor {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&mut self) -> Result<SensorStreams, SensorError> {
        if !self.handles.is_empty() {
            return Err(SensorError::Unavailable {
                name: self.name().into(),
                reason: "sensor already open".into(),
            });
        }
        self.running.store(true, Ordering::SeqCst);

        let period = Duration::from_secs_f64(1.0 / self.config.fps);
        let (depth_tx, depth_rx) = bounded(2);
        let (color_tx, color_rx) = bounded(2);

        let depth_desc = self.config.depth;
        let min_reliable = self.config.min_reliable;
        let running = self.running.clone();
        let depth_handle = thread::Builder::new()
            .name("sensor-depth".into())
            .spawn(move || depth_loop(depth_desc, min_reliable, period, running, depth_tx))?;
        self.handles.push(depth_handle);

        let color_desc = self.config.color;
        let running = self.running.clone();
        let color_handle = thread::Builder::new()
            .name("sensor-color".into())
            .spawn(move || color_loop(color_desc, period, running, color_tx))?;
        self.handles.push(color_handle);

        Ok(SensorStreams {
            depth: depth_rx,
            color: color_rx,
            depth_descriptor: depth_desc,
            color_descriptor: color_desc,
        })
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SyntheticSensor {
    fn drop(&mut self) {
        self.close();
    }
}

fn depth_loop(
    descriptor: FrameDescriptor,
    min_reliable: u16,
    period: Duration,
    running: Arc<AtomicBool>,
    tx: Sender<Result<DepthFrame, SensorError>>,
) {
    let pool = BufferPool::new(4, descriptor.frame_len());
    let mut frame_index: u64 = 0;

    while running.load(Ordering::Relaxed) {
        thread::sleep(period);
        let mut buffer = pool.acquire(descriptor.frame_len());
        fill_depth_ramp(buffer.as_mut_bytes(), &descriptor, frame_index);
        let frame = DepthFrame {
            buffer,
            descriptor,
            min_reliable,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        match tx.send_timeout(Ok(frame), SEND_TIMEOUT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                trace!(frame = frame_index, "synthetic depth frame discarded");
            }
            Err(SendTimeoutError::Disconnected(_)) => break,
        }
        frame_index = frame_index.wrapping_add(1);
    }
}

fn color_loop(
    descriptor: FrameDescriptor,
    period: Duration,
    running: Arc<AtomicBool>,
    tx: Sender<Result<ColorFrame, SensorError>>,
) {
    let pool = BufferPool::new(4, descriptor.frame_len());
    let mut frame_index: u64 = 0;

    while running.load(Ordering::Relaxed) {
        thread::sleep(period);
        let mut buffer = pool.acquire(descriptor.frame_len());
        fill_color_bars(buffer.as_mut_bytes(), &descriptor, frame_index);
        let frame = ColorFrame {
            buffer,
            descriptor,
            format: ColorFormat::Bgra8,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        match tx.send_timeout(Ok(frame), SEND_TIMEOUT) {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                trace!(frame = frame_index, "synthetic color frame discarded");
            }
            Err(SendTimeoutError::Disconnected(_)) => break,
        }
        frame_index = frame_index.wrapping_add(1);
    }
}

/// Horizontal depth ramp that scrolls a little every frame.
pub fn fill_depth_ramp(out: &mut [u8], descriptor: &FrameDescriptor, frame_index: u64) {
    let width = descriptor.width.max(1) as u64;
    for (index, sample) in out.chunks_exact_mut(2).enumerate() {
        let x = index as u64 % width;
        let depth = (x * RAMP_SPAN_MM / width + frame_index.wrapping_mul(40)) % RAMP_SPAN_MM;
        sample.copy_from_slice(&(depth as u16).to_le_bytes());
    }
}

/// Vertical BGRA color bars with an opaque alpha channel.
pub fn fill_color_bars(out: &mut [u8], descriptor: &FrameDescriptor, frame_index: u64) {
    const BARS: [[u8; 3]; 6] = [
        [255, 255, 255],
        [0, 255, 255],
        [255, 255, 0],
        [0, 255, 0],
        [255, 0, 255],
        [0, 0, 255],
    ];
    let width = descriptor.width.max(1) as usize;
    let shift = frame_index as usize;
    for (index, pixel) in out.chunks_exact_mut(4).enumerate() {
        let x = (index % width + shift) % width;
        let [b, g, r] = BARS[x * BARS.len() / width];
        pixel.copy_from_slice(&[b, g, r, 255]);
    }
}
