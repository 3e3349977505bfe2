pub mod registry;
mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Local};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};

use crate::bus::types::CanFrame;
use crate::bus::BusWriter;
use crate::config::TimingConfig;
use crate::error::{EngineError, Result};
use crate::tp::flow_control::{send_segmented, FlowControl, FlowControlParams, SendFailure, SenderTiming};
use crate::tp::frame::{single_frame, MAX_MESSAGE_LEN, MAX_SINGLE_FRAME_PAYLOAD};
use crate::trace::{hex, Tracer};
use crate::uds::correlator::Message;

pub use registry::Registry;

/// One logical UDS conversation on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId {
    /// Identifier this side transmits on
    #[serde(deserialize_with = "crate::config::can_id")]
    pub send_id: u32,
    /// Identifier the peer answers on
    #[serde(deserialize_with = "crate::config::can_id")]
    pub receive_id: u32,
    pub namespace: String,
}

impl ChannelId {
    pub fn new(send_id: u32, receive_id: u32, namespace: impl Into<String>) -> Self {
        Self {
            send_id,
            receive_id,
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} 0x{:03X}->0x{:03X}",
            self.namespace, self.send_id, self.receive_id
        )
    }
}

/// A received frame as kept in a channel's frame log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub channel: ChannelId,
    pub bytes: Vec<u8>,
    pub arrival: DateTime<Local>,
}

/// Per-channel transport settings, taken from the engine config at subscribe time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSettings {
    pub padding: Option<u8>,
    pub flow_control: FlowControlParams,
    pub timing: TimingConfig,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        crate::config::EngineConfig::default().channel_settings()
    }
}

#[derive(Default)]
struct ChannelLog {
    frames: Vec<Frame>,
    messages: Vec<Message>,
    errors: Vec<EngineError>,
}

type Inbound = std::result::Result<Vec<u8>, EngineError>;

/// State shared between a [`Channel`] handle and its receive worker
pub(crate) struct Shared {
    id: ChannelId,
    writer: BusWriter,
    padding: Option<u8>,
    log: Mutex<ChannelLog>,
    params: Mutex<FlowControlParams>,
    transmitting: AtomicBool,
    awaiting: AtomicBool,
    tracer: Tracer,
}

impl Shared {
    fn send_frame(&self, data: &[u8]) -> std::result::Result<(), String> {
        log::debug!("{} TX [{}]", self.id, hex(data));
        self.writer
            .send(&self.id.namespace, &CanFrame::new(self.id.send_id, data))
    }

    fn log(&self) -> MutexGuard<'_, ChannelLog> {
        self.log.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn params(&self) -> FlowControlParams {
        *self.params.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn is_transmitting(&self) -> bool {
        self.transmitting.load(Ordering::SeqCst)
    }

    fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::SeqCst)
    }
}

struct WorkerHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// A subscribed channel.
///
/// Frames arriving on `receive_id` are handled by a dedicated worker thread,
/// which is the only owner of the channel's reassembly state. The handle
/// transmits requests, hands completed messages to the caller and exposes the
/// diagnostic logs.
pub struct Channel {
    shared: Arc<Shared>,
    subscription: u32,
    timing: TimingConfig,
    inbound: Receiver<Inbound>,
    flow_control: Receiver<FlowControl>,
    tx_lock: Mutex<()>,
    request_lock: Mutex<()>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Channel {
    pub fn open(
        id: ChannelId,
        writer: BusWriter,
        settings: ChannelSettings,
        tracer: Tracer,
    ) -> Result<Self> {
        let subscription = writer
            .subscribe(&id.namespace, id.receive_id)
            .map_err(|e| EngineError::bus(&id, e))?;
        let handle = subscription.handle;

        let (inbound_tx, inbound_rx) = unbounded();
        let (fc_tx, fc_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();

        let shared = Arc::new(Shared {
            id: id.clone(),
            writer: writer.clone(),
            padding: settings.padding,
            log: Mutex::new(ChannelLog::default()),
            params: Mutex::new(settings.flow_control),
            transmitting: AtomicBool::new(false),
            awaiting: AtomicBool::new(false),
            tracer,
        });

        let thread = worker::spawn(
            shared.clone(),
            subscription.frames,
            stop_rx,
            inbound_tx,
            fc_tx,
            settings.timing.n_cr(),
        )
        .map_err(|e| {
            let _ = writer.unsubscribe(handle);
            EngineError::bus(&id, format!("failed to start receive worker: {}", e))
        })?;

        log::info!("{}: subscribed", id);
        Ok(Self {
            shared,
            subscription: handle,
            timing: settings.timing,
            inbound: inbound_rx,
            flow_control: fc_rx,
            tx_lock: Mutex::new(()),
            request_lock: Mutex::new(()),
            worker: Mutex::new(Some(WorkerHandle {
                stop: stop_tx,
                thread,
            })),
        })
    }

    pub fn id(&self) -> &ChannelId {
        &self.shared.id
    }

    pub fn timing(&self) -> TimingConfig {
        self.timing
    }

    pub fn tracer(&self) -> &Tracer {
        &self.shared.tracer
    }

    /// Put a UDS payload on the bus, segmenting it when it exceeds a SingleFrame.
    ///
    /// Multi-frame sends block until the peer's FlowControl frames allow every
    /// ConsecutiveFrame out, or fail with the matching flow-control error.
    pub fn transmit(&self, payload: &[u8]) -> Result<()> {
        let id = &self.shared.id;
        if payload.is_empty() {
            return Err(EngineError::EmptyRequest { channel: id.clone() });
        }
        if payload.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::PayloadTooLong {
                channel: id.clone(),
                length: payload.len(),
            });
        }

        let _guard = self.tx_lock.lock().unwrap_or_else(|p| p.into_inner());
        let padding = self.shared.padding;

        if payload.len() <= MAX_SINGLE_FRAME_PAYLOAD {
            return self
                .shared
                .send_frame(&single_frame(payload, padding))
                .map_err(|e| EngineError::bus(id, e));
        }

        // FlowControl frames left over from an earlier exchange must not release this one
        while self.flow_control.try_recv().is_ok() {}

        self.shared.transmitting.store(true, Ordering::SeqCst);
        let result = send_segmented(
            payload,
            padding,
            SenderTiming {
                n_bs: self.timing.n_bs(),
                wait_frame_max: self.timing.wait_frame_max,
            },
            |frame| self.shared.send_frame(frame),
            &self.flow_control,
        );
        self.shared.transmitting.store(false, Ordering::SeqCst);

        match result {
            Ok(frames) => {
                log::debug!("{}: sent {} bytes in {} frames", id, payload.len(), frames);
                Ok(())
            }
            Err(SendFailure::Timeout) => Err(EngineError::FlowControlTimeout {
                channel: id.clone(),
                bytes: payload.to_vec(),
            }),
            Err(SendFailure::Rejected) => Err(EngineError::FlowControlRejected {
                channel: id.clone(),
                bytes: payload.to_vec(),
            }),
            Err(SendFailure::WaitLimit(waits)) => Err(EngineError::WaitLimitExceeded {
                channel: id.clone(),
                waits,
                bytes: payload.to_vec(),
            }),
            Err(SendFailure::Bus(reason)) => Err(EngineError::bus(id, reason)),
        }
    }

    /// Send a ContinueToSend with the current parameters. Needed when
    /// `frame_control_auto` is off.
    pub fn send_flow_control(&self) -> Result<()> {
        let frame = self.shared.params().to_frame(self.shared.padding);
        self.shared
            .send_frame(&frame)
            .map_err(|e| EngineError::bus(&self.shared.id, e))
    }

    pub fn flow_control_params(&self) -> FlowControlParams {
        self.shared.params()
    }

    pub fn set_flow_control_params(&self, params: FlowControlParams) {
        *self.shared.params.lock().unwrap_or_else(|p| p.into_inner()) = params;
        log::info!(
            "{}: flow control bs={} st=0x{:02X} delay={}ms auto={}",
            self.shared.id,
            params.block_size,
            params.separation_time,
            params.frame_control_delay_ms,
            params.frame_control_auto
        );
    }

    /// Claim the channel's completed messages for one request/response exchange.
    ///
    /// Blocks while another exchange is open on this channel. Messages that
    /// arrive with no exchange open only reach the logs.
    pub fn begin_exchange(&self) -> Exchange<'_> {
        let turn = self.request_lock.lock().unwrap_or_else(|p| p.into_inner());
        let stale = self.drain_inbound();
        if stale > 0 {
            log::debug!("{}: dropped {} unclaimed messages", self.shared.id, stale);
        }
        self.shared.awaiting.store(true, Ordering::SeqCst);
        Exchange {
            channel: self,
            _turn: turn,
        }
    }

    fn drain_inbound(&self) -> usize {
        self.inbound.try_iter().count()
    }

    pub fn frame_log(&self) -> Vec<Frame> {
        self.shared.log().frames.clone()
    }

    pub fn message_log(&self) -> Vec<Message> {
        self.shared.log().messages.clone()
    }

    pub fn errors(&self) -> Vec<EngineError> {
        self.shared.log().errors.clone()
    }

    pub fn latest_message(&self) -> Option<Message> {
        self.shared.log().messages.last().cloned()
    }

    pub fn clear_logs(&self) {
        let mut log = self.shared.log();
        log.frames.clear();
        log.messages.clear();
        log.errors.clear();
    }

    pub fn is_open(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Stop the receive worker and release the bus subscription.
    /// A reassembly still in flight is discarded. Calling it twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(WorkerHandle { stop, thread }) = handle else {
            return Ok(());
        };

        drop(stop);
        if thread.join().is_err() {
            log::error!("{}: receive worker panicked", self.shared.id);
        }
        self.shared
            .writer
            .unsubscribe(self.subscription)
            .map_err(|e| EngineError::bus(&self.shared.id, e))?;
        log::info!("{}: unsubscribed", self.shared.id);
        Ok(())
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{}", e);
        }
    }
}

/// Exclusive claim on a channel's responses, released on drop
pub struct Exchange<'a> {
    channel: &'a Channel,
    _turn: MutexGuard<'a, ()>,
}

impl Exchange<'_> {
    /// Next completed message or receive-side failure.
    /// `Ok(None)` when nothing arrived within `timeout`.
    pub fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.channel.inbound.recv_timeout(timeout) {
            Ok(Ok(bytes)) => Ok(Some(bytes)),
            Ok(Err(e)) => Err(e),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::bus(&self.channel.shared.id, "channel closed"))
            }
        }
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        self.channel.shared.awaiting.store(false, Ordering::SeqCst);
        self.channel.drain_inbound();
    }
}
