//! Depth/color capture core.
//!
//! Raw frames from a [`sensor_ingest::Sensor`] are validated against their
//! stream geometry, converted into live image buffers, and every `cadence`
//! processed arrivals the buffers are written to disk alongside a GPS sample.

use std::fmt;

use serde::Serialize;

pub mod cadence;
pub mod config;
pub mod controller;
pub mod depth;
pub mod location;
pub mod persist;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod watchdog;
pub mod worker;

pub use cadence::{CadenceCounter, DEFAULT_CADENCE};
pub use config::{CaptureCliArgs, CaptureConfig, SourceKind, SourceSettings};
pub use controller::{
    ArrivalOutcome, CaptureController, ColorSession, ControllerSettings, DepthSession,
    NullRenderer, RenderSink,
};
pub use depth::{DEPTH_TO_BYTE, ReliabilityBounds};
pub use location::{Coordinate, FixedLocation, LocationProvider, SharedLocation};
pub use persist::{PersistSink, PersistStatus, PersistenceWriter, PixelLayout, Snapshot, WriteError};
pub use pipeline::{RunSummary, StreamStats, run, run_until, run_with_location};
pub use store::{ColorSlot, DepthSlot, FrameStore, GeometryMismatch};
pub use worker::PersistWorker;

/// The two independent sensor streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Depth,
    Color,
}

impl Stream {
    /// Lowercase name used in logs, metrics labels and the manifest.
    pub fn label(self) -> &'static str {
        match self {
            Stream::Depth => "depth",
            Stream::Color => "color",
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
