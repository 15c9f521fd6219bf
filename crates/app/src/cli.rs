use anyhow::Result;
use capture::{CaptureCliArgs, CaptureConfig, telemetry};
use clap::{Parser, Subcommand};

use crate::convert::{self, ConvertArgs};

/// Depth and color street recorder.
#[derive(Debug, Parser)]
#[command(name = "street-recorder", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream from a sensor and persist snapshots every N frames.
    Record(CaptureCliArgs),
    /// Turn a raw little-endian u16 depth dump into an intensity PNG.
    Convert(ConvertArgs),
}

impl Cli {
    pub fn execute(self) -> Result<()> {
        match self.command {
            Command::Record(args) => {
                telemetry::init_tracing(args.verbose);
                let config = CaptureConfig::try_from(args)?;
                capture::run(config)?;
                Ok(())
            }
            Command::Convert(args) => {
                telemetry::init_tracing(false);
                convert::run(&args)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_flags_reach_the_capture_config() {
        let cli = Cli::try_parse_from([
            "street-recorder",
            "record",
            "--output",
            "/tmp/rec",
            "--cadence",
            "15",
            "--async-persist",
        ])
        .unwrap();
        let Command::Record(args) = cli.command else {
            panic!("expected record");
        };
        let config = CaptureConfig::try_from(args).unwrap();
        assert_eq!(config.cadence.get(), 15);
        assert!(config.async_persist);
        assert_eq!(config.output_dir, std::path::PathBuf::from("/tmp/rec"));
    }

    #[test]
    fn convert_requires_geometry() {
        assert!(Cli::try_parse_from(["street-recorder", "convert", "--input", "a.raw"]).is_err());
        assert!(
            Cli::try_parse_from([
                "street-recorder",
                "convert",
                "--input",
                "a.raw",
                "--output",
                "a.png",
                "--width",
                "2",
                "--height",
                "2",
            ])
            .is_ok()
        );
    }
}
