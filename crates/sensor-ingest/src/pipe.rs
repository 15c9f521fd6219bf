//! Sensor bridged through external driver processes.
//!
//! Each stream is served by its own child process that writes fixed-size raw
//! frames to stdout: little-endian `u16` samples for depth, packed four
//! channel pixels for color. The child blocks on its pipe when we fall behind.

use std::{
    io::{ErrorKind, Read},
    process::{Child, Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use chrono::Utc;
use crossbeam_channel::{SendTimeoutError, Sender, bounded};
use tracing::{debug, warn};

use crate::{
    Sensor, SensorStreams,
    lease::{BufferPool, LeasedBuffer},
    types::{ColorFormat, ColorFrame, DepthFrame, FrameDescriptor, SensorError},
};

const SEND_RETRY: Duration = Duration::from_millis(100);

/// Command line of a bridge process and the geometry of the frames it emits.
#[derive(Clone, Debug)]
pub struct PipeStream {
    pub program: String,
    pub args: Vec<String>,
    pub descriptor: FrameDescriptor,
}

impl PipeStream {
    /// Split a whitespace separated command line into program and arguments.
    pub fn from_command_line(line: &str, descriptor: FrameDescriptor) -> Result<Self, SensorError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SensorError::Other(anyhow!("empty bridge command")))?;
        Ok(Self {
            program,
            args: parts.collect(),
            descriptor,
        })
    }

    fn spawn(&self) -> Result<Child, SensorError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| SensorError::Unavailable {
                name: self.program.clone(),
                reason: err.to_string(),
            })
    }
}

pub struct PipeSensor {
    depth: PipeStream,
    color: PipeStream,
    color_format: ColorFormat,
    min_reliable: u16,
    running: Arc<AtomicBool>,
    children: Vec<Child>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl PipeSensor {
    pub fn new(
        depth: PipeStream,
        color: PipeStream,
        color_format: ColorFormat,
        min_reliable: u16,
    ) -> Self {
        Self {
            depth,
            color,
            color_format,
            min_reliable,
            running: Arc::new(AtomicBool::new(false)),
            children: Vec::new(),
            handles: Vec::new(),
        }
    }

    fn spawn_reader<F, M>(
        &mut self,
        stream: PipeStream,
        label: &'static str,
        tx: Sender<Result<F, SensorError>>,
        make: M,
    ) -> Result<(), SensorError>
    where
        F: Send + 'static,
        M: Fn(LeasedBuffer) -> F + Send + 'static,
    {
        let mut child = stream.spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| {
            SensorError::Other(anyhow!("failed to capture {label} bridge stdout"))
        })?;
        self.children.push(child);

        let running = self.running.clone();
        let handle = thread::Builder::new()
            .name(format!("sensor-{label}"))
            .spawn(move || {
                let result = pipe_loop(stdout, stream.descriptor, label, &running, &tx, make);
                if let Err(err) = result {
                    if running.load(Ordering::Relaxed) {
                        let _ = tx.send_timeout(Err(err), SEND_RETRY);
                    }
                }
            })?;
        self.handles.push(handle);
        Ok(())
    }
}

impl Sensor for PipeSensor {
    fn name(&self) -> &str {
        "pipe"
    }

    fn open(&mut self) -> Result<SensorStreams, SensorError> {
        if !self.children.is_empty() {
            return Err(SensorError::Unavailable {
                name: self.name().into(),
                reason: "sensor already open".into(),
            });
        }
        FrameDescriptor::depth(self.depth.descriptor.width, self.depth.descriptor.height)?;
        FrameDescriptor::color(self.color.descriptor.width, self.color.descriptor.height)?;
        self.running.store(true, Ordering::SeqCst);

        let (depth_tx, depth_rx) = bounded(4);
        let (color_tx, color_rx) = bounded(4);

        let depth = self.depth.clone();
        let color = self.color.clone();
        let depth_descriptor = depth.descriptor;
        let color_descriptor = color.descriptor;
        let min_reliable = self.min_reliable;
        let color_format = self.color_format;

        let opened = self
            .spawn_reader(depth, "depth", depth_tx, move |buffer| DepthFrame {
                buffer,
                descriptor: depth_descriptor,
                min_reliable,
                timestamp_ms: Utc::now().timestamp_millis(),
            })
            .and_then(|()| {
                self.spawn_reader(color, "color", color_tx, move |buffer| ColorFrame {
                    buffer,
                    descriptor: color_descriptor,
                    format: color_format,
                    timestamp_ms: Utc::now().timestamp_millis(),
                })
            });
        if let Err(err) = opened {
            self.close();
            return Err(err);
        }

        Ok(SensorStreams {
            depth: depth_rx,
            color: color_rx,
            depth_descriptor,
            color_descriptor,
        })
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for mut child in self.children.drain(..) {
            let _ = child.kill();
            let _ = child.wait();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PipeSensor {
    fn drop(&mut self) {
        self.close();
    }
}

fn pipe_loop<F>(
    mut stdout: impl Read,
    descriptor: FrameDescriptor,
    label: &'static str,
    running: &AtomicBool,
    tx: &Sender<Result<F, SensorError>>,
    make: impl Fn(LeasedBuffer) -> F,
) -> Result<(), SensorError> {
    let frame_len = descriptor.frame_len();
    let pool = BufferPool::new(6, frame_len);
    let mut frames: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let mut buffer = pool.acquire(frame_len);
        match stdout.read_exact(buffer.as_mut_bytes()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("{label} bridge closed its output after {frames} frames");
                return Err(SensorError::Disconnected(label));
            }
            Err(err) => {
                warn!("{label} bridge read failed: {err}");
                return Err(err.into());
            }
        }
        frames = frames.wrapping_add(1);

        let mut pending = Ok(make(buffer));
        loop {
            match tx.send_timeout(pending, SEND_RETRY) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(frame)) => {
                    if !running.load(Ordering::Relaxed) {
                        return Ok(());
                    }
                    pending = frame;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Ok(()),
            }
        }
    }

    Ok(())
}
