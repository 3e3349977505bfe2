//! Periodic transmissions (network-management heartbeat, tester present, test
//! bursts) sharing the bus with request/response traffic.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::bus::types::{CanFrame, CAN_DLC};
use crate::bus::BusWriter;
use crate::channel::ChannelId;
use crate::error::{EngineError, Result};
use crate::tp::frame::{classify, FrameKind};
use crate::trace::{hex, LogDirection, Tracer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A repeating transmission as started
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodicTask {
    pub handle: TaskHandle,
    pub channel: ChannelId,
    pub frame_template: Vec<u8>,
    pub interval: Duration,
}

struct Running {
    task: PeriodicTask,
    stop: Sender<()>,
    thread: JoinHandle<()>,
    sent: Arc<AtomicU64>,
}

/// Runs each periodic task on its own thread. Tasks only write whole
/// SingleFrames through the shared [`BusWriter`]; they never touch a
/// channel's receive state.
pub struct Scheduler {
    writer: BusWriter,
    tracer: Tracer,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<TaskHandle, Running>>,
}

impl Scheduler {
    pub fn new(writer: BusWriter, tracer: Tracer) -> Self {
        Self {
            writer,
            tracer,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskHandle, Running>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start sending `frame` on `channel.send_id` every `interval`.
    /// The first frame goes out immediately.
    pub fn start(
        &self,
        channel: &ChannelId,
        frame: &[u8],
        interval: Duration,
    ) -> Result<TaskHandle> {
        validate_frame(channel, frame)?;
        if interval.is_zero() {
            return Err(EngineError::InvalidParameter {
                channel: channel.clone(),
                reason: "periodic interval must be non-zero".to_string(),
            });
        }

        let handle = TaskHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = PeriodicTask {
            handle,
            channel: channel.clone(),
            frame_template: frame.to_vec(),
            interval,
        };
        let (stop_tx, stop_rx) = unbounded();
        let sent = Arc::new(AtomicU64::new(0));

        let thread = {
            let task = task.clone();
            let writer = self.writer.clone();
            let tracer = self.tracer.clone();
            let sent = sent.clone();
            thread::Builder::new()
                .name(format!("periodic-{}", handle.0))
                .spawn(move || run(task, writer, tracer, stop_rx, sent))
                .map_err(|e| {
                    EngineError::bus(channel, format!("failed to start periodic task: {}", e))
                })?
        };

        log::info!(
            "{}: periodic task {} started [{}] every {} ms",
            channel,
            handle,
            hex(frame),
            interval.as_millis()
        );
        self.tasks().insert(
            handle,
            Running {
                task,
                stop: stop_tx,
                thread,
                sent,
            },
        );
        Ok(handle)
    }

    /// Stop a task. When this returns the task will not transmit again.
    pub fn stop(&self, handle: TaskHandle) -> Result<()> {
        let running = self
            .tasks()
            .remove(&handle)
            .ok_or(EngineError::UnknownTask { handle: handle.0 })?;
        join(running);
        Ok(())
    }

    /// Stop every task; returns how many were running
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Running> = self.tasks().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for running in drained {
            join(running);
        }
        count
    }

    pub fn is_running(&self, handle: TaskHandle) -> bool {
        self.tasks().contains_key(&handle)
    }

    pub fn running(&self) -> Vec<PeriodicTask> {
        let mut tasks: Vec<PeriodicTask> =
            self.tasks().values().map(|r| r.task.clone()).collect();
        tasks.sort_by_key(|t| t.handle);
        tasks
    }

    /// Frames a running task has put on the bus so far
    pub fn frames_sent(&self, handle: TaskHandle) -> Option<u64> {
        self.tasks()
            .get(&handle)
            .map(|r| r.sent.load(Ordering::Relaxed))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn validate_frame(channel: &ChannelId, frame: &[u8]) -> Result<()> {
    let invalid = |reason: String| EngineError::InvalidPeriodicFrame {
        channel: channel.clone(),
        bytes: frame.to_vec(),
        reason,
    };
    if frame.is_empty() || frame.len() > CAN_DLC {
        return Err(invalid(format!("frame must be 1-8 bytes, got {}", frame.len())));
    }
    let classified = classify(frame).map_err(|e| invalid(e.reason))?;
    if classified.kind() != FrameKind::SingleFrame {
        return Err(invalid(format!(
            "{:?} would interfere with segmented transfers",
            classified.kind()
        )));
    }
    Ok(())
}

fn join(running: Running) {
    let Running {
        task,
        stop,
        thread,
        sent,
    } = running;
    drop(stop);
    if thread.join().is_err() {
        log::error!("{}: periodic task {} panicked", task.channel, task.handle);
    }
    log::info!(
        "{}: periodic task {} stopped after {} frames",
        task.channel,
        task.handle,
        sent.load(Ordering::Relaxed)
    );
}

fn run(
    task: PeriodicTask,
    writer: BusWriter,
    tracer: Tracer,
    stop: Receiver<()>,
    sent: Arc<AtomicU64>,
) {
    let frame = CanFrame::new(task.channel.send_id, &task.frame_template);
    let mut next = Instant::now();

    loop {
        match writer.send(&task.channel.namespace, &frame) {
            Ok(()) => {
                sent.fetch_add(1, Ordering::Relaxed);
                log::trace!("{} TX periodic {} [{}]", task.channel, task.handle, hex(&frame.data));
            }
            Err(reason) => {
                log::warn!("{}: periodic task {} send failed: {}", task.channel, task.handle, reason);
                tracer.emit(LogDirection::Error, &task.channel, &frame.data, &reason);
            }
        }

        // Fixed cadence; an overrun skips ahead instead of bursting
        next += task.interval;
        let now = Instant::now();
        if next < now {
            next = now + task.interval;
        }

        // The stop channel is both the sleep and the cancellation
        match stop.recv_deadline(next) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
