//! Background persistence.
//!
//! Jobs carry their own copy of the pixels since the live slot is overwritten
//! by the next arrival. One thread drains the queue, so writes land in the
//! order they were dispatched. A full queue drops the newest job.

use std::{io, sync::Arc, thread};

use chrono::{DateTime, Local};
use crossbeam_channel::{Sender, TrySendError, bounded};
use tracing::{debug, warn};

use crate::{
    Stream,
    location::{Coordinate, LocationProvider},
    persist::{PersistSink, PersistStatus, PersistenceWriter, PixelLayout, Snapshot},
    telemetry,
};

pub const DEFAULT_QUEUE_CAPACITY: usize = 8;

#[derive(Debug)]
pub enum PersistJob {
    Depth {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: DateTime<Local>,
        coordinate: Coordinate,
    },
    Color {
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        timestamp: DateTime<Local>,
    },
}

impl PersistJob {
    fn stream(&self) -> Stream {
        match self {
            PersistJob::Depth { .. } => Stream::Depth,
            PersistJob::Color { .. } => Stream::Color,
        }
    }

    fn run(self, writer: &PersistenceWriter) -> PersistStatus {
        match self {
            PersistJob::Depth {
                pixels,
                width,
                height,
                timestamp,
                coordinate,
            } => {
                let snapshot = Snapshot {
                    pixels: &pixels,
                    width,
                    height,
                    layout: PixelLayout::Gray8,
                };
                writer.commit_depth(snapshot, &timestamp, || coordinate)
            }
            PersistJob::Color {
                pixels,
                width,
                height,
                timestamp,
            } => {
                let snapshot = Snapshot {
                    pixels: &pixels,
                    width,
                    height,
                    layout: PixelLayout::Bgra8,
                };
                writer.commit_color(snapshot, &timestamp)
            }
        }
    }
}

/// Single-threaded writer fed through a bounded queue.
pub struct PersistWorker {
    sender: Option<Sender<PersistJob>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PersistWorker {
    pub fn spawn(writer: Arc<PersistenceWriter>, capacity: usize) -> io::Result<Self> {
        let (sender, receiver) = bounded::<PersistJob>(capacity.max(1));
        let handle = telemetry::spawn_thread("capture-persist", move || {
            let _span = tracing::info_span!("persist.worker").entered();
            let queue_handle = receiver.clone();
            for job in receiver {
                metrics::gauge!("capture_persist_queue_depth").set(queue_handle.len() as f64);
                let stream = job.stream();
                let status = job.run(&writer);
                debug!("Background {stream} write finished: {status:?}");
            }
            metrics::gauge!("capture_persist_queue_depth").set(0.0);
        })?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue `job` without blocking the caller.
    pub fn enqueue(&self, job: PersistJob) -> PersistStatus {
        let Some(sender) = self.sender.as_ref() else {
            return PersistStatus::Rejected;
        };
        let stream = job.stream();
        match sender.try_send(job) {
            Ok(()) => {
                metrics::gauge!("capture_persist_queue_depth").set(sender.len() as f64);
                PersistStatus::Queued
            }
            Err(TrySendError::Full(_)) => {
                warn!("Persistence queue full; dropping {stream} snapshot");
                metrics::counter!("capture_persist_rejected_total", "stream" => stream.label())
                    .increment(1);
                PersistStatus::Rejected
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Persistence worker gone; dropping {stream} snapshot");
                PersistStatus::Rejected
            }
        }
    }

    /// Stop accepting jobs and wait for the queued ones to be written.
    pub fn finish(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        if let Some(handle) = self.handle.take() {
            debug!("Draining persistence queue");
            if handle.join().is_err() {
                warn!("Persistence worker panicked");
            }
        }
    }
}

impl PersistSink for PersistWorker {
    fn persist_depth(
        &self,
        snapshot: Snapshot<'_>,
        timestamp: DateTime<Local>,
        location: &dyn LocationProvider,
    ) -> PersistStatus {
        self.enqueue(PersistJob::Depth {
            pixels: snapshot.pixels.to_vec(),
            width: snapshot.width,
            height: snapshot.height,
            timestamp,
            coordinate: location.current_coordinate(),
        })
    }

    fn persist_color(&self, snapshot: Snapshot<'_>, timestamp: DateTime<Local>) -> PersistStatus {
        self.enqueue(PersistJob::Color {
            pixels: snapshot.pixels.to_vec(),
            width: snapshot.width,
            height: snapshot.height,
            timestamp,
        })
    }
}

impl Drop for PersistWorker {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::location::FixedLocation;

    fn base_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 14, 0, 0).single().unwrap()
    }

    #[test]
    fn queued_jobs_are_written_before_finish_returns() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(PersistenceWriter::new(dir.path()));
        writer.prepare().unwrap();
        let mut worker = PersistWorker::spawn(writer.clone(), 4).unwrap();
        let location = FixedLocation(Coordinate::new(3.0, 4.0));

        let gray = [9u8; 4];
        let bgra = [1u8; 16];
        for step in 0..2 {
            let ts = base_time() + Duration::seconds(step);
            let depth = Snapshot {
                pixels: &gray,
                width: 2,
                height: 2,
                layout: PixelLayout::Gray8,
            };
            let color = Snapshot {
                pixels: &bgra,
                width: 2,
                height: 2,
                layout: PixelLayout::Bgra8,
            };
            assert_ne!(
                worker.persist_depth(depth, ts, &location),
                PersistStatus::Rejected
            );
            assert_ne!(worker.persist_color(color, ts), PersistStatus::Rejected);
        }
        worker.finish();

        assert_eq!(fs::read_dir(writer.depth_dir()).unwrap().count(), 2);
        assert_eq!(fs::read_dir(writer.color_dir()).unwrap().count(), 2);
        let log = fs::read_to_string(writer.gps_log_path()).unwrap();
        assert_eq!(log.matches("Time: ").count(), 2);
        assert!(log.find("02-00-00.00").unwrap() < log.find("02-00-01.00").unwrap());
    }

    #[test]
    fn full_queue_drops_the_newest_job() {
        let (sender, receiver) = bounded(1);
        let worker = PersistWorker {
            sender: Some(sender),
            handle: None,
        };
        let job = || PersistJob::Color {
            pixels: vec![0; 4],
            width: 1,
            height: 1,
            timestamp: base_time(),
        };

        assert_eq!(worker.enqueue(job()), PersistStatus::Queued);
        assert_eq!(worker.enqueue(job()), PersistStatus::Rejected);
        assert_eq!(receiver.len(), 1);
    }

    #[test]
    fn finished_worker_rejects_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Arc::new(PersistenceWriter::new(dir.path()));
        let mut worker = PersistWorker::spawn(writer, 2).unwrap();
        worker.finish();

        let pixels = [0u8; 1];
        let snapshot = Snapshot {
            pixels: &pixels,
            width: 1,
            height: 1,
            layout: PixelLayout::Gray8,
        };
        assert_eq!(
            worker.persist_depth(snapshot, base_time(), &FixedLocation::default()),
            PersistStatus::Rejected
        );
    }
}
