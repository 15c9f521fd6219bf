//! Offline conversion of raw depth dumps.

use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use capture::{DepthSlot, PixelLayout, ReliabilityBounds, Snapshot, persist::encode_png};
use clap::Args;
use sensor_ingest::FrameDescriptor;
use tracing::info;

#[derive(Debug, Args)]
pub struct ConvertArgs {
    /// Raw depth dump, little-endian u16 per pixel.
    #[arg(long = "input", short = 'i', value_name = "FILE")]
    pub input: PathBuf,
    /// Destination PNG.
    #[arg(long = "output", short = 'o', value_name = "FILE")]
    pub output: PathBuf,
    #[arg(long = "width", value_name = "PX")]
    pub width: u32,
    #[arg(long = "height", value_name = "PX")]
    pub height: u32,
    /// Minimum reliable depth (mm).
    #[arg(long = "min-reliable", value_name = "MM", default_value_t = 0)]
    pub min_reliable: u16,
    /// Maximum reliable depth (mm).
    #[arg(long = "max-reliable", value_name = "MM", default_value_t = u16::MAX)]
    pub max_reliable: u16,
}

pub fn run(args: &ConvertArgs) -> Result<()> {
    let descriptor = FrameDescriptor::depth(args.width, args.height)
        .context("--width and --height must be positive")?;
    if args.min_reliable > args.max_reliable {
        anyhow::bail!(
            "--min-reliable ({}) must not exceed --max-reliable ({})",
            args.min_reliable,
            args.max_reliable
        );
    }

    let raw = fs::read(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let mut slot = DepthSlot::new(descriptor.width, descriptor.height);
    let bounds = ReliabilityBounds::new(args.min_reliable, args.max_reliable);
    slot.try_store(&raw, &descriptor, bounds)
        .with_context(|| format!("{} does not hold a single depth frame", args.input.display()))?;

    let snapshot = Snapshot {
        pixels: slot.pixels(),
        width: descriptor.width,
        height: descriptor.height,
        layout: PixelLayout::Gray8,
    };
    encode_png(&args.output, snapshot)?;
    info!(
        "Wrote {}x{} depth image to {}",
        descriptor.width,
        descriptor.height,
        args.output.display()
    );
    Ok(())
}
