//! Capture supervisor.
//!
//! Opens the sensor, gives each stream its own consumer thread and session,
//! and tears everything down in order once Ctrl+C arrives or both streams end.

use std::{
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use sensor_ingest::{PipeSensor, Sensor, SensorError, SyntheticSensor};
use tracing::{debug, info, warn};

use crate::{
    config::{CaptureConfig, SourceSettings},
    controller::{ArrivalOutcome, CaptureController, ControllerSettings, StreamHandler},
    location::{LocationProvider, SharedLocation},
    persist::{PersistSink, PersistStatus, PersistenceWriter},
    telemetry,
    watchdog::{StreamHealth, spawn_watchdog},
    worker::PersistWorker,
};

/// How long a consumer waits for a frame before re-checking the shutdown flag.
const RECV_POLL: Duration = Duration::from_millis(250);

/// Per-stream tallies reported when the pipeline stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub stored: u64,
    pub dropped: u64,
    pub snapshots: u64,
    pub failed_writes: u64,
    pub rejected: u64,
    pub sensor_errors: u64,
}

impl StreamStats {
    fn record(&mut self, outcome: ArrivalOutcome) {
        match outcome {
            ArrivalOutcome::Dropped(_) => self.dropped += 1,
            ArrivalOutcome::Stored => self.stored += 1,
            ArrivalOutcome::Persisted(status) => {
                self.stored += 1;
                match status {
                    PersistStatus::Written | PersistStatus::Queued => self.snapshots += 1,
                    PersistStatus::Failed => self.failed_writes += 1,
                    PersistStatus::Rejected => self.rejected += 1,
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RunSummary {
    pub depth: StreamStats,
    pub color: StreamStats,
}

/// Run until Ctrl+C, installing the signal handler and metrics exporter first.
pub fn run(config: CaptureConfig) -> Result<RunSummary> {
    let shutdown = shutdown_flag();
    telemetry::install_metrics(config.metrics_addr)?;
    run_until(config, shutdown)
}

/// Process-wide flag raised by Ctrl+C, cleared at the start of every run.
fn shutdown_flag() -> Arc<AtomicBool> {
    static SHUTDOWN: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = SHUTDOWN.get_or_init(|| {
        let flag = Arc::new(AtomicBool::new(false));
        let handler_flag = flag.clone();
        if let Err(err) = ctrlc::set_handler(move || {
            handler_flag.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
        flag
    });
    flag.store(false, Ordering::SeqCst);
    flag.clone()
}

/// Run until `shutdown` is set or both sensor streams end.
///
/// Only sensor startup failures are returned as errors; per-frame problems are
/// logged and counted in the summary.
pub fn run_until(config: CaptureConfig, shutdown: Arc<AtomicBool>) -> Result<RunSummary> {
    let location = SharedLocation::new(config.location);
    run_with_location(config, shutdown, location)
}

/// Same as [`run_until`], sampling depth snapshots from `location`.
///
/// The configured coordinate is ignored; a GPS receiver keeps `location`
/// current through [`SharedLocation::update`] while the run is in progress.
pub fn run_with_location(
    config: CaptureConfig,
    shutdown: Arc<AtomicBool>,
    location: SharedLocation,
) -> Result<RunSummary> {
    let pipeline_span = tracing::info_span!(
        "capture.pipeline",
        source = ?config.source.kind(),
        output = %config.output_dir.display(),
        cadence = config.cadence.get(),
        async_persist = config.async_persist
    );
    let _pipeline_guard = pipeline_span.enter();

    let mut sensor = build_sensor(&config.source)?;
    let streams = sensor
        .open()
        .with_context(|| format!("failed to open {} sensor", sensor.name()))?;
    info!(
        "Sensor {} open: depth {}x{}, color {}x{}",
        sensor.name(),
        streams.depth_descriptor.width,
        streams.depth_descriptor.height,
        streams.color_descriptor.width,
        streams.color_descriptor.height
    );

    let writer = PersistenceWriter::new(&config.output_dir).with_manifest(config.manifest);
    if let Err(err) = writer.prepare() {
        warn!("Output directories unavailable, snapshots will fail until they exist: {err}");
    }
    let writer = Arc::new(writer);

    let worker = if config.async_persist {
        let worker = PersistWorker::spawn(writer.clone(), config.persist_queue)
            .context("failed to spawn persistence worker")?;
        Some(Arc::new(worker))
    } else {
        None
    };
    let persist: Arc<dyn PersistSink> = match &worker {
        Some(worker) => worker.clone(),
        None => writer.clone(),
    };

    let settings = ControllerSettings {
        cadence: config.cadence,
        min_reliable_override: config.min_reliable,
        max_reliable: config.max_reliable,
    };
    let location: Arc<dyn LocationProvider> = Arc::new(location);
    let (depth_session, color_session) = CaptureController::new(
        &streams.depth_descriptor,
        &streams.color_descriptor,
        settings,
        location,
        persist,
    )
    .split();

    let health = Arc::new(StreamHealth::new());
    let watchdog_stop = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_watchdog(health.clone(), watchdog_stop.clone())
        .context("failed to spawn watchdog thread")?;

    let depth_thread = spawn_consumer(depth_session, streams.depth, &health, &shutdown);
    let color_thread = spawn_consumer(color_session, streams.color, &health, &shutdown);
    let (depth_thread, color_thread) = match (depth_thread, color_thread) {
        (Ok(depth), Ok(color)) => (depth, color),
        (depth, color) => {
            // Closing the sensor disconnects the channels, which ends any consumer that did start.
            sensor.close();
            let err = abort_consumers(depth, color);
            stop_watchdog(&watchdog_stop, watchdog);
            return Err(err);
        }
    };

    let summary = RunSummary {
        depth: join_consumer(depth_thread),
        color: join_consumer(color_thread),
    };

    stop_watchdog(&watchdog_stop, watchdog);
    sensor.close();
    // Last reference: dropping the worker drains its queue.
    drop(worker);

    info!(
        "Capture stopped: depth {} stored / {} dropped / {} snapshots, color {} stored / {} dropped / {} snapshots",
        summary.depth.stored,
        summary.depth.dropped,
        summary.depth.snapshots,
        summary.color.stored,
        summary.color.dropped,
        summary.color.snapshots
    );
    Ok(summary)
}

fn build_sensor(source: &SourceSettings) -> Result<Box<dyn Sensor>> {
    let sensor: Box<dyn Sensor> = match source {
        SourceSettings::Synthetic(config) => Box::new(
            SyntheticSensor::new(config.clone()).context("invalid synthetic sensor settings")?,
        ),
        SourceSettings::Pipe {
            depth,
            color,
            color_format,
            min_reliable,
        } => Box::new(PipeSensor::new(
            depth.clone(),
            color.clone(),
            *color_format,
            *min_reliable,
        )),
    };
    Ok(sensor)
}

fn spawn_consumer<H>(
    handler: H,
    frames: Receiver<Result<H::Frame, SensorError>>,
    health: &Arc<StreamHealth>,
    shutdown: &Arc<AtomicBool>,
) -> Result<thread::JoinHandle<StreamStats>>
where
    H: StreamHandler + 'static,
{
    let health = health.clone();
    let shutdown = shutdown.clone();
    telemetry::spawn_thread(format!("capture-{}", H::STREAM.label()), move || {
        consume(handler, &frames, &health, &shutdown)
    })
    .with_context(|| format!("failed to spawn {} consumer", H::STREAM))
}

/// Drain one stream until shutdown, disconnection or a terminal sensor error.
pub fn consume<H: StreamHandler>(
    mut handler: H,
    frames: &Receiver<Result<H::Frame, SensorError>>,
    health: &StreamHealth,
    shutdown: &AtomicBool,
) -> StreamStats {
    let stream = H::STREAM;
    let mut stats = StreamStats::default();
    while !shutdown.load(Ordering::Relaxed) {
        match frames.recv_timeout(RECV_POLL) {
            Ok(Ok(frame)) => {
                health.beat(stream);
                stats.record(handler.handle(frame));
            }
            Ok(Err(err)) if err.is_terminal() => {
                warn!("{stream} stream ended: {err}");
                break;
            }
            Ok(Err(err)) => {
                warn!("{stream} sensor error: {err}");
                stats.sensor_errors += 1;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("{stream} channel closed");
                break;
            }
        }
    }
    stats
}

/// Join whichever consumer started and hand back the spawn failure.
fn abort_consumers(
    depth: Result<thread::JoinHandle<StreamStats>>,
    color: Result<thread::JoinHandle<StreamStats>>,
) -> anyhow::Error {
    let mut failure = None;
    for spawned in [depth, color] {
        match spawned {
            Ok(handle) => {
                join_consumer(handle);
            }
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    failure.unwrap_or_else(|| anyhow!("consumer startup aborted"))
}

fn stop_watchdog(stop: &AtomicBool, handle: thread::JoinHandle<()>) {
    stop.store(true, Ordering::SeqCst);
    if handle.join().is_err() {
        warn!("Watchdog thread panicked");
    }
}

fn join_consumer(handle: thread::JoinHandle<StreamStats>) -> StreamStats {
    handle.join().unwrap_or_else(|_| {
        warn!("Consumer thread panicked");
        StreamStats::default()
    })
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU32;

    use crossbeam_channel::bounded;
    use sensor_ingest::{DepthFrame, FrameDescriptor, LeasedBuffer};

    use super::*;
    use crate::{
        controller::DepthSession,
        location::{Coordinate, FixedLocation},
        persist::Snapshot,
    };

    struct Discard;

    impl PersistSink for Discard {
        fn persist_depth(
            &self,
            _snapshot: Snapshot<'_>,
            _timestamp: chrono::DateTime<chrono::Local>,
            _location: &dyn LocationProvider,
        ) -> PersistStatus {
            PersistStatus::Written
        }

        fn persist_color(
            &self,
            _snapshot: Snapshot<'_>,
            _timestamp: chrono::DateTime<chrono::Local>,
        ) -> PersistStatus {
            PersistStatus::Failed
        }
    }

    fn depth_session(cadence: u32) -> DepthSession {
        let settings = ControllerSettings {
            cadence: NonZeroU32::new(cadence).unwrap(),
            ..ControllerSettings::default()
        };
        CaptureController::new(
            &FrameDescriptor::depth(1, 1).unwrap(),
            &FrameDescriptor::color(1, 1).unwrap(),
            settings,
            Arc::new(FixedLocation(Coordinate::default())),
            Arc::new(Discard),
        )
        .split()
        .0
    }

    fn frame(len: usize) -> Result<DepthFrame, SensorError> {
        Ok(DepthFrame {
            buffer: LeasedBuffer::detached(vec![0; len]),
            descriptor: FrameDescriptor::depth(1, 1).unwrap(),
            min_reliable: 0,
            timestamp_ms: 0,
        })
    }

    #[test]
    fn consumer_tallies_until_disconnect() {
        let (tx, rx) = bounded(8);
        for len in [2, 2, 4, 2, 2] {
            tx.send(frame(len)).unwrap();
        }
        tx.send(Err(SensorError::Io(std::io::Error::other("glitch"))))
            .unwrap();
        drop(tx);

        let stats = consume(
            depth_session(2),
            &rx,
            &StreamHealth::new(),
            &AtomicBool::new(false),
        );
        assert_eq!(
            stats,
            StreamStats {
                stored: 4,
                dropped: 1,
                snapshots: 2,
                sensor_errors: 1,
                ..StreamStats::default()
            }
        );
    }

    #[test]
    fn terminal_error_stops_the_consumer() {
        let (tx, rx) = bounded(4);
        tx.send(frame(2)).unwrap();
        tx.send(Err(SensorError::Disconnected("depth"))).unwrap();
        tx.send(frame(2)).unwrap();

        let stats = consume(
            depth_session(30),
            &rx,
            &StreamHealth::new(),
            &AtomicBool::new(false),
        );
        assert_eq!(stats.stored, 1);
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn shutdown_flag_wins_over_pending_frames() {
        let (tx, rx) = bounded(2);
        tx.send(frame(2)).unwrap();
        let stats = consume(
            depth_session(1),
            &rx,
            &StreamHealth::new(),
            &AtomicBool::new(true),
        );
        assert_eq!(stats, StreamStats::default());
    }

    #[test]
    fn failed_and_rejected_writes_are_counted_apart() {
        let mut stats = StreamStats::default();
        stats.record(ArrivalOutcome::Persisted(PersistStatus::Failed));
        stats.record(ArrivalOutcome::Persisted(PersistStatus::Rejected));
        stats.record(ArrivalOutcome::Persisted(PersistStatus::Queued));
        assert_eq!((stats.stored, stats.snapshots), (3, 1));
        assert_eq!((stats.failed_writes, stats.rejected), (1, 1));
    }

    #[test]
    fn shutdown_flag_is_shared_and_cleared_per_run() {
        let first = shutdown_flag();
        first.store(true, Ordering::SeqCst);

        let second = shutdown_flag();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!first.load(Ordering::SeqCst));

        second.store(true, Ordering::SeqCst);
        assert!(first.load(Ordering::SeqCst));
    }

    #[test]
    fn aborted_startup_joins_the_started_consumer() {
        let (tx, rx) = bounded(2);
        tx.send(frame(2)).unwrap();
        drop(tx);
        let health = Arc::new(StreamHealth::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let started = spawn_consumer(depth_session(30), rx, &health, &shutdown);
        assert!(started.is_ok());

        let err = abort_consumers(started, Err(anyhow!("failed to spawn color consumer")));
        assert_eq!(err.to_string(), "failed to spawn color consumer");
        assert_eq!(Arc::strong_count(&health), 1);
        assert_eq!(Arc::strong_count(&shutdown), 1);
    }
}
