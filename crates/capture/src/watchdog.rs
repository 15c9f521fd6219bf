//! Stall detection for the two sensor streams.
//!
//! Consumer loops beat once per delivered frame. The watchdog only reports a
//! stall; a quiet stream is a legitimate state (sensor covered, bridge paused)
//! and nothing is restarted.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{info, warn};

use crate::{Stream, telemetry};

/// Sleep interval between health checks.
pub const WATCHDOG_POLL_INTERVAL_MS: u64 = 500;
/// Time without a frame before a stream is reported as stalled.
pub const WATCHDOG_STALE_THRESHOLD_MS: u64 = 3_000;
/// Grace period at startup while the sensor warms up.
pub const WATCHDOG_STARTUP_GRACE_MS: u64 = 5_000;

pub struct StreamHealth {
    depth: AtomicU64,
    color: AtomicU64,
}

impl StreamHealth {
    pub fn new() -> Self {
        Self::starting_at(current_millis())
    }

    fn starting_at(now: u64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            depth: AtomicU64::new(grace_deadline),
            color: AtomicU64::new(grace_deadline),
        }
    }

    fn slot(&self, stream: Stream) -> &AtomicU64 {
        match stream {
            Stream::Depth => &self.depth,
            Stream::Color => &self.color,
        }
    }

    /// Register a frame delivery for `stream`.
    pub fn beat(&self, stream: Stream) {
        self.beat_at(stream, current_millis());
    }

    fn beat_at(&self, stream: Stream, now: u64) {
        self.slot(stream).store(now, Ordering::Relaxed);
    }

    /// Whether `stream` has been quiet for longer than the stall threshold.
    pub fn is_stale(&self, stream: Stream, now: u64) -> bool {
        now.saturating_sub(self.slot(stream).load(Ordering::Relaxed)) > WATCHDOG_STALE_THRESHOLD_MS
    }
}

impl Default for StreamHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks whether a stall has already been reported so each one warns once.
#[derive(Default)]
struct StallLatch {
    depth: bool,
    color: bool,
}

impl StallLatch {
    fn flag(&mut self, stream: Stream) -> &mut bool {
        match stream {
            Stream::Depth => &mut self.depth,
            Stream::Color => &mut self.color,
        }
    }

    /// Returns the transition to report, if any: `Some(true)` for a new stall,
    /// `Some(false)` for a recovery.
    fn update(&mut self, stream: Stream, stale: bool) -> Option<bool> {
        let flag = self.flag(stream);
        if *flag == stale {
            return None;
        }
        *flag = stale;
        Some(stale)
    }
}

/// Spawn the watchdog thread; it exits once `shutdown` is set.
pub fn spawn_watchdog(
    health: Arc<StreamHealth>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("capture-watchdog", move || {
        let mut latch = StallLatch::default();
        while !shutdown.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let now = current_millis();
            for stream in [Stream::Depth, Stream::Color] {
                match latch.update(stream, health.is_stale(stream, now)) {
                    Some(true) => warn!(
                        "No {stream} frames for over {} ms",
                        WATCHDOG_STALE_THRESHOLD_MS
                    ),
                    Some(false) => info!("{stream} frames flowing again"),
                    None => {}
                }
            }
        }
    })
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
