//! Configuration for the `record` pipeline.
//!
//! `CaptureCliArgs` is what clap parses; `CaptureConfig` is the validated form
//! every stage reads.

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf};

use anyhow::{Result, anyhow, bail};
use clap::{Args, ValueEnum};
use sensor_ingest::{ColorFormat, FrameDescriptor, PipeStream, SyntheticConfig};

use crate::{
    cadence::DEFAULT_CADENCE,
    location::{Coordinate, FixedLocation},
    persist::DEFAULT_OUTPUT_DIR,
    worker::DEFAULT_QUEUE_CAPACITY,
};

/// Minimum reliable distance assumed for bridges that cannot report one.
pub const DEFAULT_MIN_RELIABLE_MM: u16 = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    /// In-process generator producing depth ramps and color bars.
    Synthetic,
    /// External bridge processes writing raw frames to stdout.
    Pipe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ColorFormatArg {
    Bgra,
    Rgba,
}

impl From<ColorFormatArg> for ColorFormat {
    fn from(arg: ColorFormatArg) -> Self {
        match arg {
            ColorFormatArg::Bgra => ColorFormat::Bgra8,
            ColorFormatArg::Rgba => ColorFormat::Rgba8,
        }
    }
}

/// Where frames come from.
#[derive(Clone, Debug)]
pub enum SourceSettings {
    Synthetic(SyntheticConfig),
    Pipe {
        depth: PipeStream,
        color: PipeStream,
        color_format: ColorFormat,
        min_reliable: u16,
    },
}

impl SourceSettings {
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceSettings::Synthetic(_) => SourceKind::Synthetic,
            SourceSettings::Pipe { .. } => SourceKind::Pipe,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Base directory holding `Depth/`, `Color/` and `GPSLog.txt`.
    pub output_dir: PathBuf,
    pub cadence: NonZeroU32,
    /// Replaces the sensor-advertised minimum reliable distance.
    pub min_reliable: Option<u16>,
    pub max_reliable: u16,
    pub source: SourceSettings,
    /// Coordinate reported by the fixed location provider.
    pub location: Coordinate,
    /// Persist on a background worker instead of the arrival thread.
    pub async_persist: bool,
    pub persist_queue: usize,
    pub manifest: bool,
    pub metrics_addr: Option<SocketAddr>,
    pub verbose: bool,
}

/// CLI arguments accepted by the `record` subcommand.
#[derive(Debug, Args)]
pub struct CaptureCliArgs {
    /// Base output directory.
    #[arg(long = "output", short = 'o', value_name = "DIR", default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,
    /// Processed arrivals per stream between snapshots.
    #[arg(long = "cadence", value_name = "N", default_value_t = DEFAULT_CADENCE.get())]
    pub cadence: u32,
    /// Override the sensor's minimum reliable depth (mm).
    #[arg(long = "min-reliable", value_name = "MM")]
    pub min_reliable: Option<u16>,
    /// Maximum reliable depth (mm).
    #[arg(long = "max-reliable", value_name = "MM", default_value_t = u16::MAX)]
    pub max_reliable: u16,

    /// Frame source.
    #[arg(long = "source", value_enum, default_value_t = SourceKind::Synthetic)]
    pub source: SourceKind,
    /// Command line of the depth bridge (pipe source).
    #[arg(long = "depth-cmd", value_name = "CMD")]
    pub depth_cmd: Option<String>,
    /// Command line of the color bridge (pipe source).
    #[arg(long = "color-cmd", value_name = "CMD")]
    pub color_cmd: Option<String>,
    /// Channel order written by the color bridge.
    #[arg(long = "color-format", value_enum, default_value_t = ColorFormatArg::Bgra)]
    pub color_format: ColorFormatArg,
    /// Depth frame width in pixels.
    #[arg(long = "width", value_name = "PX")]
    pub width: Option<u32>,
    /// Depth frame height in pixels.
    #[arg(long = "height", value_name = "PX")]
    pub height: Option<u32>,
    /// Color frame width in pixels.
    #[arg(long = "color-width", value_name = "PX")]
    pub color_width: Option<u32>,
    /// Color frame height in pixels.
    #[arg(long = "color-height", value_name = "PX")]
    pub color_height: Option<u32>,
    /// Frame rate of the synthetic source.
    #[arg(long = "fps", value_name = "HZ", default_value_t = 30.0)]
    pub fps: f64,

    /// Fixed latitude (falls back to STREET_RECORDER_LAT).
    #[arg(long = "latitude", value_name = "DEG", allow_negative_numbers = true)]
    pub latitude: Option<f64>,
    /// Fixed longitude (falls back to STREET_RECORDER_LON).
    #[arg(long = "longitude", value_name = "DEG", allow_negative_numbers = true)]
    pub longitude: Option<f64>,

    /// Write snapshots on a background thread.
    #[arg(long = "async-persist", action = clap::ArgAction::SetTrue)]
    pub async_persist: bool,
    /// Capacity of the background persistence queue.
    #[arg(long = "persist-queue", value_name = "N", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub persist_queue: usize,
    /// Append a JSON line per snapshot to captures.jsonl.
    #[arg(long = "manifest", action = clap::ArgAction::SetTrue)]
    pub manifest: bool,
    /// Serve Prometheus metrics on this address.
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
    /// Debug-level logging.
    #[arg(long = "verbose", short = 'v', action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
}

impl TryFrom<CaptureCliArgs> for CaptureConfig {
    type Error = anyhow::Error;

    fn try_from(args: CaptureCliArgs) -> Result<Self> {
        let cadence =
            NonZeroU32::new(args.cadence).ok_or_else(|| anyhow!("--cadence must be at least 1"))?;

        if let Some(min) = args.min_reliable {
            if min > args.max_reliable {
                bail!(
                    "--min-reliable ({min}) must not exceed --max-reliable ({})",
                    args.max_reliable
                );
            }
        }

        if args.persist_queue == 0 {
            bail!("--persist-queue must be at least 1");
        }
        if args.persist_queue != DEFAULT_QUEUE_CAPACITY && !args.async_persist {
            tracing::warn!("--persist-queue has no effect without --async-persist");
        }

        let defaults = SyntheticConfig::default();
        let depth = FrameDescriptor::depth(
            args.width.unwrap_or(defaults.depth.width),
            args.height.unwrap_or(defaults.depth.height),
        )
        .map_err(|_| anyhow!("--width and --height must be positive"))?;
        let color = FrameDescriptor::color(
            args.color_width.unwrap_or(defaults.color.width),
            args.color_height.unwrap_or(defaults.color.height),
        )
        .map_err(|_| anyhow!("--color-width and --color-height must be positive"))?;

        let source = match args.source {
            SourceKind::Synthetic => {
                if !(args.fps.is_finite() && args.fps > 0.0) {
                    bail!("--fps must be a positive number");
                }
                SourceSettings::Synthetic(SyntheticConfig {
                    depth,
                    color,
                    fps: args.fps,
                    min_reliable: defaults.min_reliable,
                })
            }
            SourceKind::Pipe => {
                let (Some(depth_cmd), Some(color_cmd)) = (args.depth_cmd, args.color_cmd) else {
                    bail!("--source pipe requires both --depth-cmd and --color-cmd");
                };
                SourceSettings::Pipe {
                    depth: PipeStream::from_command_line(&depth_cmd, depth)?,
                    color: PipeStream::from_command_line(&color_cmd, color)?,
                    color_format: args.color_format.into(),
                    min_reliable: args.min_reliable.unwrap_or(DEFAULT_MIN_RELIABLE_MM),
                }
            }
        };

        let env = FixedLocation::from_env().0;
        let location = Coordinate::new(
            args.latitude.unwrap_or(env.latitude),
            args.longitude.unwrap_or(env.longitude),
        );
        if !(-90.0..=90.0).contains(&location.latitude) {
            bail!("latitude {} is outside [-90, 90]", location.latitude);
        }
        if !(-180.0..=180.0).contains(&location.longitude) {
            bail!("longitude {} is outside [-180, 180]", location.longitude);
        }

        Ok(Self {
            output_dir: args.output,
            cadence,
            min_reliable: args.min_reliable,
            max_reliable: args.max_reliable,
            source,
            location,
            async_persist: args.async_persist,
            persist_queue: args.persist_queue,
            manifest: args.manifest,
            metrics_addr: args.metrics_addr,
            verbose: args.verbose,
        })
    }
}
