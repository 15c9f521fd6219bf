//! Snapshot persistence: PNG images, the GPS log, and the optional capture manifest.
//!
//! Every failure here is reported as a [`WriteError`] and then logged and
//! swallowed by the commit helpers. The capture loop never sees an I/O error;
//! a failed write only means a missing file for that cadence cycle.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Instant,
};

use chrono::{DateTime, Local};
use image::{ExtendedColorType, ImageEncoder, ImageError, codecs::png::PngEncoder};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    Stream,
    location::{Coordinate, LocationProvider},
};

pub const DEFAULT_OUTPUT_DIR: &str = "StreetRecorder";
pub const DEPTH_DIR: &str = "Depth";
pub const COLOR_DIR: &str = "Color";
pub const DEPTH_PREFIX: &str = "Depth";
pub const COLOR_PREFIX: &str = "Color";
pub const GPS_LOG_FILE: &str = "GPSLog.txt";
pub const MANIFEST_FILE: &str = "captures.jsonl";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("destination {} is unreachable: {source}", .path.display())]
    DirectoryUnreachable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("permission denied writing {}: {source}", .path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("disk full writing {}: {source}", .path.display())]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("{} expects {expected} bytes but the buffer holds {actual}", .path.display())]
    BufferSize {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("failed to serialise manifest entry: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    /// Classify an I/O failure on `path`.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            ErrorKind::NotFound | ErrorKind::NotADirectory => {
                WriteError::DirectoryUnreachable { path, source }
            }
            ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                WriteError::PermissionDenied { path, source }
            }
            ErrorKind::StorageFull => WriteError::DiskFull { path, source },
            _ => WriteError::Io { path, source },
        }
    }

    fn from_image(path: &Path, err: ImageError) -> Self {
        match err {
            ImageError::IoError(source) => WriteError::from_io(path, source),
            source => WriteError::Encode {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

/// Pixel layout of an in-memory snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelLayout {
    /// One intensity byte per pixel.
    Gray8,
    /// Blue, green, red, alpha.
    Bgra8,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelLayout::Gray8 => 1,
            PixelLayout::Bgra8 => 4,
        }
    }
}

/// Borrowed view of a live buffer at the moment it is persisted.
#[derive(Clone, Copy, Debug)]
pub struct Snapshot<'a> {
    pub pixels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl Snapshot<'_> {
    fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }
}

/// Render a timestamp as `MMddyyyy_hh-mm-ss.ff` (12-hour clock, hundredths).
pub fn format_timestamp(timestamp: &DateTime<Local>) -> String {
    let hundredths = timestamp.timestamp_subsec_millis().min(999) / 10;
    format!("{}.{hundredths:02}", timestamp.format("%m%d%Y_%I-%M-%S"))
}

/// File name for a snapshot taken at `timestamp`.
pub fn image_file_name(prefix: &str, timestamp: &DateTime<Local>) -> String {
    format!("{prefix}-{}.png", format_timestamp(timestamp))
}

/// Encode `snapshot` as a PNG at `path`, replacing any existing file.
///
/// A partially written file is removed when encoding fails.
pub fn encode_png(path: &Path, snapshot: Snapshot<'_>) -> Result<(), WriteError> {
    let expected = snapshot.expected_len();
    if snapshot.pixels.len() != expected {
        return Err(WriteError::BufferSize {
            path: path.to_path_buf(),
            expected,
            actual: snapshot.pixels.len(),
        });
    }

    let file = File::create(path).map_err(|err| WriteError::from_io(path, err))?;
    let mut writer = BufWriter::new(file);

    let encoded = match snapshot.layout {
        PixelLayout::Gray8 => PngEncoder::new(&mut writer)
            .write_image(
                snapshot.pixels,
                snapshot.width,
                snapshot.height,
                ExtendedColorType::L8,
            )
            .map_err(|err| WriteError::from_image(path, err)),
        PixelLayout::Bgra8 => {
            let rgba = bgra_to_rgba(snapshot.pixels);
            PngEncoder::new(&mut writer)
                .write_image(
                    &rgba,
                    snapshot.width,
                    snapshot.height,
                    ExtendedColorType::Rgba8,
                )
                .map_err(|err| WriteError::from_image(path, err))
        }
    }
    .and_then(|()| writer.flush().map_err(|err| WriteError::from_io(path, err)));

    if encoded.is_err() {
        drop(writer);
        let _ = fs::remove_file(path);
    }
    encoded
}

fn bgra_to_rgba(bgra: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(bgra.len());
    for px in bgra.chunks_exact(4) {
        rgba.extend_from_slice(&[px[2], px[1], px[0], px[3]]);
    }
    rgba
}

/// Encode `snapshot` into `directory/prefix-<timestamp>.png` and return the path.
pub fn write_image(
    snapshot: Snapshot<'_>,
    directory: &Path,
    prefix: &str,
    timestamp: &DateTime<Local>,
) -> Result<PathBuf, WriteError> {
    let path = directory.join(image_file_name(prefix, timestamp));
    encode_png(&path, snapshot)?;
    Ok(path)
}

/// Append one `Time:` / `Latitude: .. Longitude: ..` entry to the log at `path`.
///
/// The file is created when missing and closed again before returning.
pub fn append_location_log(
    path: &Path,
    timestamp: &DateTime<Local>,
    coordinate: Coordinate,
) -> Result<(), WriteError> {
    let entry = format!(
        "Time: {}\n\tLatitude: {} Longitude: {}\n",
        format_timestamp(timestamp),
        coordinate.latitude,
        coordinate.longitude
    );
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| WriteError::from_io(path, err))?;
    file.write_all(entry.as_bytes())
        .map_err(|err| WriteError::from_io(path, err))
}

/// One line of `captures.jsonl`.
#[derive(Debug, Serialize)]
pub struct ManifestEntry {
    pub stream: &'static str,
    pub path: String,
    pub timestamp: String,
    pub width: u32,
    pub height: u32,
    #[serde(flatten)]
    pub coordinate: Option<Coordinate>,
}

/// Outcome of handing a due snapshot to a persistence sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistStatus {
    /// Every file for this cycle was written.
    Written,
    /// At least one write failed; the failure was logged.
    Failed,
    /// Accepted by a background worker.
    Queued,
    /// Discarded because the background queue was full or closed.
    Rejected,
}

/// Destination for snapshots whose cadence came due.
pub trait PersistSink: Send + Sync {
    fn persist_depth(
        &self,
        snapshot: Snapshot<'_>,
        timestamp: DateTime<Local>,
        location: &dyn LocationProvider,
    ) -> PersistStatus;

    fn persist_color(&self, snapshot: Snapshot<'_>, timestamp: DateTime<Local>) -> PersistStatus;
}

/// Writes snapshots under a base directory laid out as
/// `Depth/`, `Color/`, `GPSLog.txt` and, when enabled, `captures.jsonl`.
#[derive(Debug)]
pub struct PersistenceWriter {
    base: PathBuf,
    manifest: bool,
    manifest_lock: Mutex<()>,
}

impl PersistenceWriter {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            manifest: false,
            manifest_lock: Mutex::new(()),
        }
    }

    pub fn with_manifest(mut self, enabled: bool) -> Self {
        self.manifest = enabled;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn depth_dir(&self) -> PathBuf {
        self.base.join(DEPTH_DIR)
    }

    pub fn color_dir(&self) -> PathBuf {
        self.base.join(COLOR_DIR)
    }

    pub fn gps_log_path(&self) -> PathBuf {
        self.base.join(GPS_LOG_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.base.join(MANIFEST_FILE)
    }

    /// Create the image directories.
    pub fn prepare(&self) -> Result<(), WriteError> {
        for dir in [self.depth_dir(), self.color_dir()] {
            fs::create_dir_all(&dir).map_err(|err| WriteError::from_io(&dir, err))?;
        }
        Ok(())
    }

    fn record_manifest(&self, entry: &ManifestEntry) -> Result<(), WriteError> {
        if !self.manifest {
            return Ok(());
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let path = self.manifest_path();
        let _guard = self.manifest_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| WriteError::from_io(&path, err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| WriteError::from_io(&path, err))
    }

    /// Write the depth image, then the GPS entry with a coordinate sampled
    /// after the image write. A failed image still gets its GPS entry; only
    /// the manifest line, which names the image, is skipped.
    pub fn commit_depth(
        &self,
        snapshot: Snapshot<'_>,
        timestamp: &DateTime<Local>,
        sample: impl FnOnce() -> Coordinate,
    ) -> PersistStatus {
        let _span = tracing::info_span!("persist.image", stream = "depth").entered();
        let started = Instant::now();
        let mut status = PersistStatus::Written;

        let image = write_image(snapshot, &self.depth_dir(), DEPTH_PREFIX, timestamp);
        if let Err(err) = &image {
            report_failure(Stream::Depth, err);
            status = PersistStatus::Failed;
        }

        let coordinate = sample();
        let gps_span = tracing::info_span!("persist.gps");
        if let Err(err) = gps_span
            .in_scope(|| append_location_log(&self.gps_log_path(), timestamp, coordinate))
        {
            report_failure(Stream::Depth, &err);
            status = PersistStatus::Failed;
        }

        let Ok(path) = image else {
            return status;
        };
        let entry = ManifestEntry {
            stream: Stream::Depth.label(),
            path: path.display().to_string(),
            timestamp: format_timestamp(timestamp),
            width: snapshot.width,
            height: snapshot.height,
            coordinate: Some(coordinate),
        };
        if let Err(err) = self.record_manifest(&entry) {
            report_failure(Stream::Depth, &err);
            status = PersistStatus::Failed;
        }

        finish(Stream::Depth, &path, started, status)
    }

    /// Write the color image. Color snapshots never touch the GPS log.
    pub fn commit_color(&self, snapshot: Snapshot<'_>, timestamp: &DateTime<Local>) -> PersistStatus {
        let _span = tracing::info_span!("persist.image", stream = "color").entered();
        let started = Instant::now();

        let path = match write_image(snapshot, &self.color_dir(), COLOR_PREFIX, timestamp) {
            Ok(path) => path,
            Err(err) => {
                report_failure(Stream::Color, &err);
                return PersistStatus::Failed;
            }
        };

        let entry = ManifestEntry {
            stream: Stream::Color.label(),
            path: path.display().to_string(),
            timestamp: format_timestamp(timestamp),
            width: snapshot.width,
            height: snapshot.height,
            coordinate: None,
        };
        let status = match self.record_manifest(&entry) {
            Ok(()) => PersistStatus::Written,
            Err(err) => {
                report_failure(Stream::Color, &err);
                PersistStatus::Failed
            }
        };

        finish(Stream::Color, &path, started, status)
    }
}

impl PersistSink for PersistenceWriter {
    fn persist_depth(
        &self,
        snapshot: Snapshot<'_>,
        timestamp: DateTime<Local>,
        location: &dyn LocationProvider,
    ) -> PersistStatus {
        self.commit_depth(snapshot, &timestamp, || location.current_coordinate())
    }

    fn persist_color(&self, snapshot: Snapshot<'_>, timestamp: DateTime<Local>) -> PersistStatus {
        self.commit_color(snapshot, &timestamp)
    }
}

fn report_failure(stream: Stream, err: &WriteError) {
    warn!("{} snapshot write failed: {err}", stream.label());
    metrics::counter!("capture_write_errors_total", "stream" => stream.label()).increment(1);
}

fn finish(stream: Stream, path: &Path, started: Instant, status: PersistStatus) -> PersistStatus {
    let elapsed = started.elapsed();
    debug!(
        "Persisted {} snapshot to {} in {:.1} ms",
        stream.label(),
        path.display(),
        elapsed.as_secs_f64() * 1_000.0
    );
    metrics::counter!("capture_persist_total", "stream" => stream.label()).increment(1);
    metrics::histogram!("capture_persist_seconds", "stream" => stream.label())
        .record(elapsed.as_secs_f64());
    status
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32, minute: u32, second: u32, millis: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 7, hour, minute, second)
            .single()
            .unwrap()
            + chrono::Duration::milliseconds(millis as i64)
    }

    #[test]
    fn timestamp_uses_twelve_hour_clock_and_hundredths() {
        assert_eq!(format_timestamp(&at(15, 4, 5, 678)), "03072024_03-04-05.67");
        assert_eq!(format_timestamp(&at(0, 0, 0, 9)), "03072024_12-00-00.00");
        assert_eq!(
            image_file_name("Depth", &at(11, 59, 59, 990)),
            "Depth-03072024_11-59-59.99.png"
        );
    }

    #[test]
    fn location_log_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GPS_LOG_FILE);
        fs::write(&path, "existing\n").unwrap();

        append_location_log(&path, &at(9, 0, 0, 0), Coordinate::new(0.0, 0.0)).unwrap();
        append_location_log(&path, &at(9, 0, 1, 500), Coordinate::new(47.25, -122.5)).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "existing\n\
             Time: 03072024_09-00-00.00\n\tLatitude: 0 Longitude: 0\n\
             Time: 03072024_09-00-01.50\n\tLatitude: 47.25 Longitude: -122.5\n"
        );
    }

    #[test]
    fn gray_image_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let pixels: Vec<u8> = (0..12).map(|v| v * 20).collect();
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 4,
            height: 3,
            layout: PixelLayout::Gray8,
        };
        let path = write_image(snapshot, dir.path(), DEPTH_PREFIX, &at(1, 2, 3, 40)).unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "Depth-03072024_01-02-03.04.png"
        );

        let decoded = image::open(&path).unwrap().to_luma8();
        assert_eq!(decoded.dimensions(), (4, 3));
        assert_eq!(decoded.into_raw(), pixels);
    }

    #[test]
    fn bgra_image_is_stored_as_rgba() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = [10u8, 20, 30, 255, 40, 50, 60, 128];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 2,
            height: 1,
            layout: PixelLayout::Bgra8,
        };
        let path = write_image(snapshot, dir.path(), COLOR_PREFIX, &at(1, 2, 3, 0)).unwrap();
        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.into_raw(), vec![30, 20, 10, 255, 60, 50, 40, 128]);
    }

    #[test]
    fn missing_directory_is_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = [0u8; 4];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 2,
            height: 2,
            layout: PixelLayout::Gray8,
        };
        let err = write_image(snapshot, &dir.path().join("gone"), "Depth", &at(1, 0, 0, 0))
            .unwrap_err();
        assert!(matches!(err, WriteError::DirectoryUnreachable { .. }));
    }

    #[test]
    fn wrong_buffer_size_is_reported_without_creating_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = [0u8; 3];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 2,
            height: 2,
            layout: PixelLayout::Gray8,
        };
        let err = write_image(snapshot, dir.path(), "Depth", &at(1, 0, 0, 0)).unwrap_err();
        assert!(matches!(
            err,
            WriteError::BufferSize {
                expected: 4,
                actual: 3,
                ..
            }
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn io_errors_are_classified() {
        let denied = io::Error::from(ErrorKind::PermissionDenied);
        assert!(matches!(
            WriteError::from_io("/x", denied),
            WriteError::PermissionDenied { .. }
        ));
        let full = io::Error::from(ErrorKind::StorageFull);
        assert!(matches!(
            WriteError::from_io("/x", full),
            WriteError::DiskFull { .. }
        ));
        let other = io::Error::from(ErrorKind::Interrupted);
        assert!(matches!(WriteError::from_io("/x", other), WriteError::Io { .. }));
    }

    #[test]
    fn commit_depth_writes_image_log_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path()).with_manifest(true);
        writer.prepare().unwrap();

        let pixels = [7u8; 6];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 3,
            height: 2,
            layout: PixelLayout::Gray8,
        };
        let status = writer.commit_depth(snapshot, &at(8, 30, 0, 0), || {
            Coordinate::new(1.25, 2.5)
        });
        assert_eq!(status, PersistStatus::Written);

        assert_eq!(fs::read_dir(writer.depth_dir()).unwrap().count(), 1);
        let log = fs::read_to_string(writer.gps_log_path()).unwrap();
        assert!(log.ends_with("\tLatitude: 1.25 Longitude: 2.5\n"));

        let manifest = fs::read_to_string(writer.manifest_path()).unwrap();
        let entry: serde_json::Value = serde_json::from_str(manifest.trim()).unwrap();
        assert_eq!(entry["stream"], "depth");
        assert_eq!(entry["latitude"], 1.25);
        assert_eq!(entry["width"], 3);
    }

    #[test]
    fn commit_color_skips_gps_log() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path());
        writer.prepare().unwrap();

        let pixels = [1u8; 4];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 1,
            height: 1,
            layout: PixelLayout::Bgra8,
        };
        assert_eq!(
            writer.commit_color(snapshot, &at(8, 30, 0, 0)),
            PersistStatus::Written
        );
        assert_eq!(fs::read_dir(writer.color_dir()).unwrap().count(), 1);
        assert!(!writer.gps_log_path().exists());
        assert!(!writer.manifest_path().exists());
    }

    #[test]
    fn depth_image_failure_still_logs_location() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path()).with_manifest(true);
        let pixels = [0u8; 4];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 2,
            height: 2,
            layout: PixelLayout::Gray8,
        };
        let status = writer.commit_depth(snapshot, &at(8, 30, 0, 0), || {
            Coordinate::new(1.0, 2.0)
        });
        assert_eq!(status, PersistStatus::Failed);
        assert!(!writer.depth_dir().exists());

        let log = fs::read_to_string(writer.gps_log_path()).unwrap();
        assert_eq!(
            log,
            "Time: 03072024_08-30-00.00\n\tLatitude: 1 Longitude: 2\n"
        );
        assert!(!writer.manifest_path().exists());
    }

    #[test]
    fn unreachable_base_fails_both_writes_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PersistenceWriter::new(dir.path().join("missing"));
        let pixels = [0u8; 1];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 1,
            height: 1,
            layout: PixelLayout::Gray8,
        };
        let status = writer.commit_depth(snapshot, &at(8, 30, 0, 0), Coordinate::default);
        assert_eq!(status, PersistStatus::Failed);
        assert!(!writer.gps_log_path().exists());
    }
}
