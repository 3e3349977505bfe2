//! Flow control for both directions: the parameters a receiver advertises and
//! the sender-side session that obeys the peer's FlowControl frames.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::tp::frame::{
    consecutive_frame, first_frame, flow_control_frame, FlowStatus, Pci,
    CONSECUTIVE_FRAME_PAYLOAD, FIRST_FRAME_PAYLOAD,
};

/// STmin applied when the peer sends a reserved separation-time byte
const RESERVED_SEPARATION_TIME: Duration = Duration::from_millis(0x7F);

/// Parameters this side advertises when it is the receiver of a multi-frame message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlParams {
    /// ConsecutiveFrames the sender may emit before waiting for the next FlowControl (0 = unlimited)
    pub block_size: u8,
    /// Raw STmin byte
    pub separation_time: u8,
    /// Delay between accepting a FirstFrame and emitting the FlowControl
    pub frame_control_delay_ms: u64,
    /// If false the engine never answers a FirstFrame on its own
    pub frame_control_auto: bool,
}

impl Default for FlowControlParams {
    fn default() -> Self {
        Self {
            block_size: 0,
            separation_time: 0,
            frame_control_delay_ms: 0,
            frame_control_auto: true,
        }
    }
}

impl FlowControlParams {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.frame_control_delay_ms)
    }

    /// ContinueToSend frame carrying these parameters
    pub fn to_frame(&self, padding: Option<u8>) -> Vec<u8> {
        flow_control_frame(
            FlowStatus::ContinueToSend,
            self.block_size,
            self.separation_time,
            padding,
        )
    }
}

/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 µs.
pub fn is_valid_separation_time(st: u8) -> bool {
    st <= 0x7F || (0xF1..=0xF9).contains(&st)
}

pub fn separation_time_to_duration(st: u8) -> Duration {
    match st {
        0x00..=0x7F => Duration::from_millis(st as u64),
        0xF1..=0xF9 => Duration::from_micros((st - 0xF0) as u64 * 100),
        _ => RESERVED_SEPARATION_TIME,
    }
}

/// FlowControl frame received from the peer while sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    pub block_size: u8,
    pub separation_time: u8,
}

impl FlowControl {
    pub fn from_pci(pci: &Pci<'_>) -> Option<Self> {
        match *pci {
            Pci::FlowControl {
                status,
                block_size,
                separation_time,
            } => Some(Self {
                status,
                block_size,
                separation_time,
            }),
            _ => None,
        }
    }

    pub fn continue_to_send(block_size: u8, separation_time: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            separation_time,
        }
    }
}

/// Cuts an outgoing payload into a FirstFrame followed by ConsecutiveFrames
#[derive(Debug, Clone)]
pub struct Segmenter {
    payload: Vec<u8>,
    offset: usize,
    sequence: u8,
}

impl Segmenter {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            offset: 0,
            sequence: 1,
        }
    }

    pub fn total_length(&self) -> usize {
        self.payload.len()
    }

    pub fn first_frame(&mut self, padding: Option<u8>) -> Vec<u8> {
        let end = self.payload.len().min(FIRST_FRAME_PAYLOAD);
        self.offset = end;
        self.sequence = 1;
        first_frame(self.payload.len(), &self.payload[..end], padding)
    }

    pub fn next_consecutive(&mut self, padding: Option<u8>) -> Option<Vec<u8>> {
        if self.is_done() {
            return None;
        }
        let end = (self.offset + CONSECUTIVE_FRAME_PAYLOAD).min(self.payload.len());
        let frame = consecutive_frame(self.sequence, &self.payload[self.offset..end], padding);
        self.offset = end;
        self.sequence = (self.sequence + 1) & 0x0F;
        Some(frame)
    }

    pub fn is_done(&self) -> bool {
        self.offset >= self.payload.len()
    }
}

/// Timing limits for the sender side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderTiming {
    /// N_Bs: how long to wait for each FlowControl
    pub n_bs: Duration,
    /// Consecutive Wait frames tolerated (0 = unlimited)
    pub wait_frame_max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    Timeout,
    Rejected,
    WaitLimit(u32),
    Bus(String),
}

/// Send a multi-frame payload, obeying the peer's FlowControl frames.
///
/// `send` writes one frame to the bus, `flow_control` yields the peer's FC
/// frames as the channel worker receives them. Returns the number of frames sent.
pub fn send_segmented<F>(
    payload: &[u8],
    padding: Option<u8>,
    timing: SenderTiming,
    mut send: F,
    flow_control: &Receiver<FlowControl>,
) -> Result<usize, SendFailure>
where
    F: FnMut(&[u8]) -> Result<(), String>,
{
    let mut segmenter = Segmenter::new(payload.to_vec());
    send(&segmenter.first_frame(padding)).map_err(SendFailure::Bus)?;
    let mut frames_sent = 1;
    let mut last_consecutive: Option<Instant> = None;

    while !segmenter.is_done() {
        let fc = await_clear_to_send(timing, flow_control)?;
        let gap = separation_time_to_duration(fc.separation_time);
        let mut sent_in_block: u32 = 0;

        while let Some(frame) = segmenter.next_consecutive(padding) {
            if let Some(last) = last_consecutive {
                let due = last + gap;
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
            }
            send(&frame).map_err(SendFailure::Bus)?;
            last_consecutive = Some(Instant::now());
            frames_sent += 1;
            sent_in_block += 1;

            if fc.block_size != 0 && sent_in_block == fc.block_size as u32 {
                break;
            }
        }
    }

    Ok(frames_sent)
}

fn await_clear_to_send(
    timing: SenderTiming,
    flow_control: &Receiver<FlowControl>,
) -> Result<FlowControl, SendFailure> {
    let mut waits: u32 = 0;
    loop {
        // Every FC, Wait included, re-arms N_Bs
        match flow_control.recv_timeout(timing.n_bs) {
            Ok(fc) => match fc.status {
                FlowStatus::ContinueToSend => return Ok(fc),
                FlowStatus::Wait => {
                    waits += 1;
                    if timing.wait_frame_max != 0 && waits > timing.wait_frame_max {
                        return Err(SendFailure::WaitLimit(waits));
                    }
                    log::debug!("flow control wait #{}", waits);
                }
                FlowStatus::Overflow => return Err(SendFailure::Rejected),
            },
            Err(RecvTimeoutError::Timeout) => return Err(SendFailure::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SendFailure::Bus("flow control path closed".to_string()))
            }
        }
    }
}
