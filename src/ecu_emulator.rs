use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::types::CanFrame;
use crate::bus::virtual_bus::{BusNode, Reply};
use crate::channel::ChannelId;
use crate::tp::flow_control::{separation_time_to_duration, FlowControl, Segmenter};
use crate::tp::frame::{
    classify, flow_control_frame, single_frame, FlowStatus, Pci, MAX_SINGLE_FRAME_PAYLOAD,
    SID_NEGATIVE_RESPONSE,
};
use crate::tp::reassembly::{Progress, ReassemblyState};
use crate::trace::hex;
use crate::uds::error::NegativeResponseCode;
use crate::uds::services::{did, ecu_addr};

/// Spacing of FlowControl Wait frames sent before ContinueToSend
pub const WAIT_FRAME_GAP: Duration = Duration::from_millis(20);

// ─── ECU Identification ──────────────────────────────────────────────

/// Bench ECUs with their CAN addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EcuId {
    Imc,
    Gwm,
    Bcm,
}

impl EcuId {
    /// CAN ID used to send requests TO this ECU (from tester perspective)
    pub fn tx_id(self) -> u32 {
        match self {
            EcuId::Imc => ecu_addr::IMC_TX,
            EcuId::Gwm => ecu_addr::GWM_TX,
            EcuId::Bcm => ecu_addr::BCM_TX,
        }
    }

    /// CAN ID used for responses FROM this ECU
    pub fn rx_id(self) -> u32 {
        match self {
            EcuId::Imc => ecu_addr::IMC_RX,
            EcuId::Gwm => ecu_addr::GWM_RX,
            EcuId::Bcm => ecu_addr::BCM_RX,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EcuId::Imc => "IMC",
            EcuId::Gwm => "GWM",
            EcuId::Bcm => "BCM",
        }
    }

    /// Tester-side channel for talking to this ECU
    pub fn channel(self, namespace: &str) -> ChannelId {
        ChannelId::new(self.tx_id(), self.rx_id(), namespace)
    }
}

impl fmt::Display for EcuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EcuId {
    type Err = String;

    /// Case-insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "imc" => Ok(EcuId::Imc),
            "gwm" => Ok(EcuId::Gwm),
            "bcm" => Ok(EcuId::Bcm),
            other => Err(format!("unknown ECU {:?}", other)),
        }
    }
}

// ─── ECU Handler Trait ───────────────────────────────────────────────

/// Trait for ECU-specific response logic
pub trait EcuHandler: Send {
    /// Build a UDS response for a complete request payload.
    /// Returns None if the ECU stays silent.
    fn build_response(&self, request: &[u8]) -> Option<Vec<u8>>;

    /// ECU name for logging
    fn name(&self) -> &str;

    /// responsePending (0x78) frames sent before the final answer
    fn response_pending(&self, _request: &[u8]) -> u32 {
        0
    }
}

// ─── Bench Handler ───────────────────────────────────────────────────

/// Long data record, answered with a FirstFrame + ConsecutiveFrame
pub const DIAG_RECORD: [u8; 7] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77];
pub const VIN: &[u8; 17] = b"SAJBL4BVXGCY16353";

/// Answers the handful of services the bench exercises
pub struct BenchHandler {
    name: String,
}

impl BenchHandler {
    pub fn new(ecu: EcuId) -> Self {
        Self {
            name: ecu.name().to_string(),
        }
    }
}

impl EcuHandler for BenchHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_response(&self, request: &[u8]) -> Option<Vec<u8>> {
        match request {
            // TesterPresent, suppressPosRspMsgIndicationBit set
            [0x3E, 0x80, ..] => None,

            [0x3E, 0x00, ..] => Some(vec![0x7E, 0x00]),

            // DiagnosticSessionControl: P2 25 ms, P2* 5000 ms
            [0x10, session, ..] => Some(vec![0x50, *session, 0x00, 0x19, 0x01, 0xF4]),

            [0x11, reset_type, ..] => Some(vec![0x51, *reset_type]),

            // ReadDataByIdentifier (22 XX XX)
            [0x22, did_hi, did_lo] => {
                let mut resp = vec![0x62, *did_hi, *did_lo];
                match u16::from_be_bytes([*did_hi, *did_lo]) {
                    did::SW_VERSION => resp.push(0x01),
                    did::DIAG_RECORD => resp.extend_from_slice(&DIAG_RECORD),
                    did::VIN => resp.extend_from_slice(VIN),
                    did::SW_PART => {
                        // 24 bytes, null-padded
                        let mut part = b"GX73-14C184-AK".to_vec();
                        part.resize(24, 0x00);
                        resp.extend_from_slice(&part);
                    }
                    did::ECU_SERIAL => resp.extend_from_slice(b"1979149808"),
                    _ => return Some(negative(0x22, NegativeResponseCode::RequestOutOfRange)),
                }
                Some(resp)
            }
            [0x22, ..] => Some(negative(
                0x22,
                NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat,
            )),

            // WriteDataByIdentifier (2E XX XX ...)
            [0x2E, did_hi, did_lo, _, ..] => Some(vec![0x6E, *did_hi, *did_lo]),

            // RoutineControl (31 XX XX XX)
            [0x31, sub_fn, rid_hi, rid_lo, ..] => Some(vec![0x71, *sub_fn, *rid_hi, *rid_lo]),

            [sid, ..] => Some(negative(*sid, NegativeResponseCode::ServiceNotSupported)),

            [] => None,
        }
    }

    /// Routines take a while on the real module
    fn response_pending(&self, request: &[u8]) -> u32 {
        match request {
            [0x31, ..] => 2,
            _ => 0,
        }
    }
}

fn negative(sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![SID_NEGATIVE_RESPONSE, sid, nrc.to_byte()]
}

// ─── Emulated ECU (ISO-TP peer) ──────────────────────────────────────

/// How the ECU answers a tester's FirstFrame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowBehaviour {
    /// ContinueToSend straight away
    Normal,
    /// This many Wait frames, `WAIT_FRAME_GAP` apart, then ContinueToSend
    Waits(u32),
    /// Overflow: the request is refused
    Overflow,
    /// No FlowControl at all
    Silent,
}

/// An ECU on the virtual bus that speaks the transport protocol: it
/// reassembles segmented requests, answers through its [`EcuHandler`] and
/// segments long responses under the tester's FlowControl.
pub struct EmulatedEcu {
    handler: Box<dyn EcuHandler>,
    namespace: String,
    request_id: u32,
    response_id: u32,
    padding: Option<u8>,
    flow: FlowBehaviour,
    block_size: u8,
    separation_time: u8,
    pending_interval: Duration,
    rx: ReassemblyState,
    tx: Option<Segmenter>,
}

impl EmulatedEcu {
    pub fn new<H: EcuHandler + 'static>(
        handler: H,
        request_id: u32,
        response_id: u32,
        namespace: &str,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            namespace: namespace.to_string(),
            request_id,
            response_id,
            padding: Some(0x00),
            flow: FlowBehaviour::Normal,
            block_size: 0,
            separation_time: 0,
            pending_interval: Duration::from_millis(50),
            rx: ReassemblyState::new(),
            tx: None,
        }
    }

    /// Bench handler on the ECU's own addresses
    pub fn bench(ecu: EcuId, namespace: &str) -> Self {
        Self::new(BenchHandler::new(ecu), ecu.tx_id(), ecu.rx_id(), namespace)
    }

    /// FlowControl parameters the ECU advertises when receiving a segmented request
    pub fn with_flow_control(mut self, block_size: u8, separation_time: u8) -> Self {
        self.block_size = block_size;
        self.separation_time = separation_time;
        self
    }

    pub fn with_flow_behaviour(mut self, flow: FlowBehaviour) -> Self {
        self.flow = flow;
        self
    }

    pub fn with_padding(mut self, padding: Option<u8>) -> Self {
        self.padding = padding;
        self
    }

    /// Gap between responsePending frames and before the final answer
    pub fn with_pending_interval(mut self, interval: Duration) -> Self {
        self.pending_interval = interval;
        self
    }

    fn frame(&self, data: Vec<u8>) -> CanFrame {
        CanFrame::new(self.response_id, &data)
    }

    fn flow_control(&self, status: FlowStatus) -> CanFrame {
        self.frame(flow_control_frame(
            status,
            self.block_size,
            self.separation_time,
            self.padding,
        ))
    }

    /// FlowControl answering a FirstFrame from the tester
    fn accept_first_frame(&mut self) -> Vec<Reply> {
        match self.flow {
            FlowBehaviour::Normal => vec![Reply::now(self.flow_control(FlowStatus::ContinueToSend))],
            FlowBehaviour::Waits(count) => {
                let mut replies: Vec<Reply> = (0..count)
                    .map(|i| Reply::after(WAIT_FRAME_GAP * i, self.flow_control(FlowStatus::Wait)))
                    .collect();
                replies.push(Reply::after(
                    WAIT_FRAME_GAP * count,
                    self.flow_control(FlowStatus::ContinueToSend),
                ));
                replies
            }
            FlowBehaviour::Overflow => {
                self.rx.reset();
                vec![Reply::now(self.flow_control(FlowStatus::Overflow))]
            }
            FlowBehaviour::Silent => vec![],
        }
    }

    fn respond(&mut self, request: Vec<u8>) -> Vec<Reply> {
        log::debug!("{}: request [{}]", self.handler.name(), hex(&request));
        let Some(response) = self.handler.build_response(&request) else {
            return vec![];
        };
        let sid = request.first().copied().unwrap_or(0);
        let pending = self.handler.response_pending(&request);

        let mut replies: Vec<Reply> = (0..pending)
            .map(|i| {
                let data = negative(sid, NegativeResponseCode::RequestCorrectlyReceivedResponsePending);
                Reply::after(
                    self.pending_interval * i,
                    self.frame(single_frame(&data, self.padding)),
                )
            })
            .collect();
        let delay = self.pending_interval * pending;

        if response.len() <= MAX_SINGLE_FRAME_PAYLOAD {
            replies.push(Reply::after(
                delay,
                self.frame(single_frame(&response, self.padding)),
            ));
        } else {
            let mut segmenter = Segmenter::new(response);
            let first = segmenter.first_frame(self.padding);
            replies.push(Reply::after(delay, self.frame(first)));
            self.tx = Some(segmenter);
        }
        replies
    }

    /// ConsecutiveFrames released by the tester's FlowControl
    fn on_flow_control(&mut self, fc: FlowControl) -> Vec<Reply> {
        let padding = self.padding;
        let response_id = self.response_id;
        let Some(segmenter) = self.tx.as_mut() else {
            log::debug!("{}: flow control while idle", self.handler.name());
            return vec![];
        };

        match fc.status {
            FlowStatus::Wait => vec![],
            FlowStatus::Overflow => {
                self.tx = None;
                vec![]
            }
            FlowStatus::ContinueToSend => {
                let gap = separation_time_to_duration(fc.separation_time);
                let mut replies = Vec::new();
                while let Some(cf) = segmenter.next_consecutive(padding) {
                    replies.push(Reply::after(
                        gap * replies.len() as u32,
                        CanFrame::new(response_id, &cf),
                    ));
                    if fc.block_size != 0 && replies.len() == fc.block_size as usize {
                        break;
                    }
                }
                if segmenter.is_done() {
                    self.tx = None;
                }
                replies
            }
        }
    }
}

impl BusNode for EmulatedEcu {
    fn on_frame(&mut self, namespace: &str, frame: &CanFrame) -> Vec<Reply> {
        if namespace != self.namespace || frame.can_id != self.request_id {
            return vec![];
        }
        let classified = match classify(&frame.data) {
            Ok(classified) => classified,
            Err(e) => {
                log::warn!("{}: {}", self.handler.name(), e);
                return vec![];
            }
        };

        if let Some(fc) = FlowControl::from_pci(&classified.pci) {
            return self.on_flow_control(fc);
        }
        if let Pci::Reserved { .. } = classified.pci {
            return vec![];
        }

        match self.rx.on_frame(&classified.pci, self.block_size) {
            Ok(step) => match step.progress {
                Progress::Complete(request) if request.is_empty() => vec![],
                Progress::Complete(request) => self.respond(request),
                Progress::FlowControlDue => self.accept_first_frame(),
                Progress::Continue {
                    block_boundary: true,
                } => vec![Reply::now(self.flow_control(FlowStatus::ContinueToSend))],
                Progress::Continue { .. } | Progress::Ignored => vec![],
            },
            Err(e) => {
                log::warn!("{}: {:?}, request dropped", self.handler.name(), e);
                self.rx.reset();
                vec![]
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
