use std::{
    fs,
    num::NonZeroU32,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use capture::{
    CaptureConfig, Coordinate, SharedLocation, SourceSettings, run_until, run_with_location,
};
use sensor_ingest::{ColorFormat, FrameDescriptor, PipeStream, SyntheticConfig};

fn config(output: &Path, source: SourceSettings, async_persist: bool) -> CaptureConfig {
    CaptureConfig {
        output_dir: output.to_path_buf(),
        cadence: NonZeroU32::new(10).unwrap(),
        min_reliable: None,
        max_reliable: u16::MAX,
        source,
        location: Coordinate::new(40.0, -74.0),
        async_persist,
        persist_queue: 4,
        manifest: false,
        metrics_addr: None,
        verbose: false,
    }
}

fn synthetic() -> SourceSettings {
    SourceSettings::Synthetic(SyntheticConfig {
        depth: FrameDescriptor::depth(16, 8).unwrap(),
        color: FrameDescriptor::color(16, 8).unwrap(),
        fps: 100.0,
        min_reliable: 500,
    })
}

fn stop_after(shutdown: &Arc<AtomicBool>, delay: Duration) -> thread::JoinHandle<()> {
    let shutdown = shutdown.clone();
    thread::spawn(move || {
        thread::sleep(delay);
        shutdown.store(true, Ordering::SeqCst);
    })
}

#[test]
fn synthetic_run_writes_snapshots_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let stopper = stop_after(&shutdown, Duration::from_millis(800));

    let summary = run_until(config(dir.path(), synthetic(), false), shutdown).unwrap();
    stopper.join().unwrap();

    assert!(summary.depth.snapshots >= 1, "{summary:?}");
    assert_eq!(summary.depth.dropped, 0);
    assert!(fs::read_dir(dir.path().join("Depth")).unwrap().count() >= 1);

    let log = fs::read_to_string(dir.path().join("GPSLog.txt")).unwrap();
    assert_eq!(
        log.matches("Time: ").count() as u64,
        summary.depth.snapshots + summary.depth.failed_writes
    );
    assert!(log.contains("Latitude: 40 Longitude: -74"));
}

#[test]
fn async_run_drains_queue_before_returning() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let stopper = stop_after(&shutdown, Duration::from_millis(800));

    let summary = run_until(config(dir.path(), synthetic(), true), shutdown).unwrap();
    stopper.join().unwrap();

    let log = fs::read_to_string(dir.path().join("GPSLog.txt")).unwrap();
    assert_eq!(log.matches("Time: ").count() as u64, summary.depth.snapshots);
    assert!(summary.color.snapshots >= 1, "{summary:?}");
}

#[test]
fn receiver_coordinate_replaces_the_configured_one() {
    let dir = tempfile::tempdir().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let location = SharedLocation::new(Coordinate::new(12.5, 7.25));
    let stopper = stop_after(&shutdown, Duration::from_millis(800));

    let summary =
        run_with_location(config(dir.path(), synthetic(), false), shutdown, location).unwrap();
    stopper.join().unwrap();

    assert!(summary.depth.snapshots >= 1, "{summary:?}");
    let log = fs::read_to_string(dir.path().join("GPSLog.txt")).unwrap();
    assert!(log.contains("Latitude: 12.5 Longitude: 7.25"));
    assert!(!log.contains("Latitude: 40"));
}

#[test]
fn unavailable_sensor_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let missing = "street-recorder-bridge-that-does-not-exist";
    let source = SourceSettings::Pipe {
        depth: PipeStream::from_command_line(missing, FrameDescriptor::depth(4, 4).unwrap())
            .unwrap(),
        color: PipeStream::from_command_line(missing, FrameDescriptor::color(4, 4).unwrap())
            .unwrap(),
        color_format: ColorFormat::Bgra8,
        min_reliable: 500,
    };

    let err = run_until(
        config(dir.path(), source, false),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("failed to open pipe sensor"));
    assert!(!dir.path().join("Depth").exists());
}

#[cfg(unix)]
#[test]
fn pipe_source_runs_until_bridges_close() {
    let dir = tempfile::tempdir().unwrap();
    let depth_dump = dir.path().join("depth.raw");
    let color_dump = dir.path().join("color.raw");
    let depth_frame: Vec<u8> = std::iter::repeat_n(3100u16, 4)
        .flat_map(u16::to_le_bytes)
        .collect();
    fs::write(&depth_dump, depth_frame.repeat(10)).unwrap();
    fs::write(&color_dump, vec![200u8; 16 * 3]).unwrap();

    let output = dir.path().join("out");
    let source = SourceSettings::Pipe {
        depth: PipeStream::from_command_line(
            &format!("cat {}", depth_dump.display()),
            FrameDescriptor::depth(2, 2).unwrap(),
        )
        .unwrap(),
        color: PipeStream::from_command_line(
            &format!("cat {}", color_dump.display()),
            FrameDescriptor::color(2, 2).unwrap(),
        )
        .unwrap(),
        color_format: ColorFormat::Rgba8,
        min_reliable: 0,
    };

    let summary = run_until(
        config(&output, source, false),
        Arc::new(AtomicBool::new(false)),
    )
    .unwrap();

    assert_eq!(summary.depth.stored, 10);
    assert_eq!(summary.depth.snapshots, 1);
    assert_eq!(summary.color.stored, 3);
    assert_eq!(summary.color.snapshots, 0);

    let depth_images: Vec<_> = fs::read_dir(output.join("Depth")).unwrap().collect();
    assert_eq!(depth_images.len(), 1);
    let path = depth_images[0].as_ref().unwrap().path();
    let decoded = image::open(path).unwrap().to_luma8();
    assert!(decoded.pixels().all(|p| p.0[0] == 100));
}
