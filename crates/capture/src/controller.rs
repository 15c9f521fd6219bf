//! Per-arrival orchestration for the depth and color streams.
//!
//! Each stream is a session owning its slot and its cadence counter, so the two
//! streams never share mutable state. [`CaptureController`] bundles both for
//! single-threaded callers and [`CaptureController::split`] hands them to
//! separate consumer threads.

use std::{num::NonZeroU32, sync::Arc};

use chrono::{DateTime, Local};
use sensor_ingest::{ColorFrame, DepthFrame, FrameDescriptor};
use tracing::debug;

use crate::{
    Stream,
    cadence::{CadenceCounter, DEFAULT_CADENCE},
    depth::ReliabilityBounds,
    location::LocationProvider,
    persist::{PersistSink, PersistStatus, PixelLayout, Snapshot},
    store::{ColorSlot, DepthSlot, FrameStore, GeometryMismatch},
};

/// Wall clock used to stamp persisted snapshots.
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Presentation hook called with the live buffer after every stored arrival.
///
/// Implementations must copy what they need; the buffer changes on the next arrival.
pub trait RenderSink: Send + Sync {
    fn render_depth(&self, intensity: &[u8], width: u32, height: u32);
    fn render_color(&self, bgra: &[u8], width: u32, height: u32);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullRenderer;

impl RenderSink for NullRenderer {
    fn render_depth(&self, _intensity: &[u8], _width: u32, _height: u32) {}
    fn render_color(&self, _bgra: &[u8], _width: u32, _height: u32) {}
}

/// What happened to a single arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArrivalOutcome {
    /// Geometry check failed; the slot and the counter are unchanged.
    Dropped(GeometryMismatch),
    /// Stored and counted, cadence not yet due.
    Stored,
    /// Stored, and this arrival completed a cadence cycle.
    Persisted(PersistStatus),
}

#[derive(Clone, Copy, Debug)]
pub struct ControllerSettings {
    pub cadence: NonZeroU32,
    /// Replaces the per-frame minimum advertised by the sensor.
    pub min_reliable_override: Option<u16>,
    pub max_reliable: u16,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cadence: DEFAULT_CADENCE,
            min_reliable_override: None,
            max_reliable: u16::MAX,
        }
    }
}

fn local_now() -> DateTime<Local> {
    Local::now()
}

/// Consumer side of one stream, driven by the pipeline's per-stream loop.
pub trait StreamHandler: Send {
    type Frame: Send + 'static;
    const STREAM: Stream;

    fn handle(&mut self, frame: Self::Frame) -> ArrivalOutcome;
}

fn record_drop(mismatch: &GeometryMismatch) {
    debug!("{mismatch}");
    metrics::counter!("capture_frames_dropped_total", "stream" => mismatch.stream.label())
        .increment(1);
}

pub struct DepthSession {
    slot: DepthSlot,
    cadence: CadenceCounter,
    min_reliable_override: Option<u16>,
    max_reliable: u16,
    location: Arc<dyn LocationProvider>,
    persist: Arc<dyn PersistSink>,
    renderer: Arc<dyn RenderSink>,
    clock: Clock,
}

impl DepthSession {
    /// Reliability window for a frame whose sensor reports `sensor_min`.
    pub fn bounds_for(&self, sensor_min: u16) -> ReliabilityBounds {
        ReliabilityBounds::new(
            self.min_reliable_override.unwrap_or(sensor_min),
            self.max_reliable,
        )
    }

    pub fn handle(&mut self, frame: DepthFrame) -> ArrivalOutcome {
        let _span = tracing::debug_span!("capture.depth", sensor_ts = frame.timestamp_ms).entered();
        let DepthFrame {
            buffer,
            descriptor,
            min_reliable,
            ..
        } = frame;
        let bounds = self.bounds_for(min_reliable);

        let stored = self.slot.try_store(buffer.as_bytes(), &descriptor, bounds);
        drop(buffer);
        if let Err(mismatch) = stored {
            record_drop(&mismatch);
            return ArrivalOutcome::Dropped(mismatch);
        }
        metrics::counter!("capture_frames_total", "stream" => "depth").increment(1);

        let FrameDescriptor { width, height, .. } = self.slot.descriptor();
        self.renderer.render_depth(self.slot.pixels(), width, height);

        if !self.cadence.record_arrival() {
            return ArrivalOutcome::Stored;
        }
        let snapshot = Snapshot {
            pixels: self.slot.pixels(),
            width,
            height,
            layout: PixelLayout::Gray8,
        };
        let status = self
            .persist
            .persist_depth(snapshot, (self.clock)(), self.location.as_ref());
        ArrivalOutcome::Persisted(status)
    }

    /// Processed arrivals since the last snapshot.
    pub fn count(&self) -> u32 {
        self.cadence.count()
    }

    pub fn slot(&self) -> &DepthSlot {
        &self.slot
    }
}

impl StreamHandler for DepthSession {
    type Frame = DepthFrame;
    const STREAM: Stream = Stream::Depth;

    fn handle(&mut self, frame: DepthFrame) -> ArrivalOutcome {
        DepthSession::handle(self, frame)
    }
}

pub struct ColorSession {
    slot: ColorSlot,
    cadence: CadenceCounter,
    persist: Arc<dyn PersistSink>,
    renderer: Arc<dyn RenderSink>,
    clock: Clock,
}

impl ColorSession {
    pub fn handle(&mut self, frame: ColorFrame) -> ArrivalOutcome {
        let _span = tracing::debug_span!("capture.color", sensor_ts = frame.timestamp_ms).entered();
        let ColorFrame {
            buffer,
            descriptor,
            format,
            ..
        } = frame;

        let stored = self.slot.try_store(buffer.as_bytes(), &descriptor, format);
        drop(buffer);
        if let Err(mismatch) = stored {
            record_drop(&mismatch);
            return ArrivalOutcome::Dropped(mismatch);
        }
        metrics::counter!("capture_frames_total", "stream" => "color").increment(1);

        let FrameDescriptor { width, height, .. } = self.slot.descriptor();
        self.renderer.render_color(self.slot.pixels(), width, height);

        if !self.cadence.record_arrival() {
            return ArrivalOutcome::Stored;
        }
        let snapshot = Snapshot {
            pixels: self.slot.pixels(),
            width,
            height,
            layout: PixelLayout::Bgra8,
        };
        ArrivalOutcome::Persisted(self.persist.persist_color(snapshot, (self.clock)()))
    }

    pub fn count(&self) -> u32 {
        self.cadence.count()
    }

    pub fn slot(&self) -> &ColorSlot {
        &self.slot
    }
}

impl StreamHandler for ColorSession {
    type Frame = ColorFrame;
    const STREAM: Stream = Stream::Color;

    fn handle(&mut self, frame: ColorFrame) -> ArrivalOutcome {
        ColorSession::handle(self, frame)
    }
}

pub struct CaptureController {
    depth: DepthSession,
    color: ColorSession,
}

impl CaptureController {
    pub fn new(
        depth: &FrameDescriptor,
        color: &FrameDescriptor,
        settings: ControllerSettings,
        location: Arc<dyn LocationProvider>,
        persist: Arc<dyn PersistSink>,
    ) -> Self {
        let renderer: Arc<dyn RenderSink> = Arc::new(NullRenderer);
        let clock: Clock = Arc::new(local_now);
        let (depth_slot, color_slot) = FrameStore::new(depth, color).into_slots();
        Self {
            depth: DepthSession {
                slot: depth_slot,
                cadence: CadenceCounter::new(settings.cadence),
                min_reliable_override: settings.min_reliable_override,
                max_reliable: settings.max_reliable,
                location,
                persist: persist.clone(),
                renderer: renderer.clone(),
                clock: clock.clone(),
            },
            color: ColorSession {
                slot: color_slot,
                cadence: CadenceCounter::new(settings.cadence),
                persist,
                renderer,
                clock,
            },
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn RenderSink>) -> Self {
        self.depth.renderer = renderer.clone();
        self.color.renderer = renderer;
        self
    }

    /// Replace the wall clock used to name snapshots.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.depth.clock = clock.clone();
        self.color.clock = clock;
        self
    }

    pub fn handle_depth(&mut self, frame: DepthFrame) -> ArrivalOutcome {
        self.depth.handle(frame)
    }

    pub fn handle_color(&mut self, frame: ColorFrame) -> ArrivalOutcome {
        self.color.handle(frame)
    }

    pub fn depth(&self) -> &DepthSession {
        &self.depth
    }

    pub fn color(&self) -> &ColorSession {
        &self.color
    }

    pub fn split(self) -> (DepthSession, ColorSession) {
        (self.depth, self.color)
    }
}
