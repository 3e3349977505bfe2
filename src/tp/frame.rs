//! Protocol control information: classify raw CAN data and build outgoing frames.

use crate::bus::types::CAN_DLC;
use crate::trace::hex;

/// Most payload bytes a SingleFrame can carry
pub const MAX_SINGLE_FRAME_PAYLOAD: usize = 7;
/// Payload bytes carried by a FirstFrame
pub const FIRST_FRAME_PAYLOAD: usize = 6;
/// Payload bytes carried by a ConsecutiveFrame
pub const CONSECUTIVE_FRAME_PAYLOAD: usize = 7;
/// 12-bit FirstFrame length field
pub const MAX_MESSAGE_LEN: usize = 0x0FFF;

pub const SID_NEGATIVE_RESPONSE: u8 = 0x7F;
pub const SID_READ_DATA_BY_IDENTIFIER_POSITIVE: u8 = 0x62;

const PCI_SINGLE: u8 = 0x0;
const PCI_FIRST: u8 = 0x1;
const PCI_CONSECUTIVE: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// Frame type carried in the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    SingleFrame,
    FirstFrame,
    ConsecutiveFrame,
    FlowControl,
    Reserved,
}

/// Flow status nibble of a FlowControl frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FlowStatus {
    ContinueToSend,
    Wait,
    Overflow,
}

impl FlowStatus {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::ContinueToSend),
            0x1 => Some(Self::Wait),
            0x2 => Some(Self::Overflow),
            _ => None,
        }
    }

    pub fn to_nibble(self) -> u8 {
        match self {
            Self::ContinueToSend => 0x0,
            Self::Wait => 0x1,
            Self::Overflow => 0x2,
        }
    }
}

/// Parsed view of one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pci<'a> {
    SingleFrame {
        data: &'a [u8],
    },
    FirstFrame {
        total_length: usize,
        data: &'a [u8],
    },
    ConsecutiveFrame {
        sequence: u8,
        data: &'a [u8],
    },
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        separation_time: u8,
    },
    Reserved {
        pci: u8,
    },
}

impl Pci<'_> {
    pub fn kind(&self) -> FrameKind {
        match self {
            Pci::SingleFrame { .. } => FrameKind::SingleFrame,
            Pci::FirstFrame { .. } => FrameKind::FirstFrame,
            Pci::ConsecutiveFrame { .. } => FrameKind::ConsecutiveFrame,
            Pci::FlowControl { .. } => FrameKind::FlowControl,
            Pci::Reserved { .. } => FrameKind::Reserved,
        }
    }
}

/// What the first payload byte of a Single/First frame says about the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceTag {
    /// 0x62, positive ReadDataByIdentifier response
    ReadDataPositive,
    /// 0x7F followed by the echoed request SID and NRC
    Negative { request_sid: u8, nrc: u8 },
    /// Anything else at the SID position
    Unexpected(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFrame<'a> {
    pub pci: Pci<'a>,
    /// Present for Single/First frames that carry at least one payload byte
    pub service: Option<ServiceTag>,
}

impl ClassifiedFrame<'_> {
    pub fn kind(&self) -> FrameKind {
        self.pci.kind()
    }

    pub fn unexpected_sid(&self) -> bool {
        matches!(self.service, Some(ServiceTag::Unexpected(_)))
    }
}

/// Frame whose declared sizes don't fit the bytes it carries
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed frame [{}]: {reason}", hex(.bytes))]
pub struct MalformedFrame {
    pub bytes: Vec<u8>,
    pub reason: String,
}

fn malformed(bytes: &[u8], reason: impl Into<String>) -> MalformedFrame {
    MalformedFrame {
        bytes: bytes.to_vec(),
        reason: reason.into(),
    }
}

/// Classify one CAN data frame (normal addressing, PCI at byte 0).
pub fn classify(bytes: &[u8]) -> Result<ClassifiedFrame<'_>, MalformedFrame> {
    if bytes.is_empty() {
        return Err(malformed(bytes, "empty frame"));
    }
    if bytes.len() > CAN_DLC {
        return Err(malformed(bytes, format!("{} bytes exceed CAN DLC", bytes.len())));
    }

    let pci = match bytes[0] >> 4 {
        PCI_SINGLE => {
            let size = (bytes[0] & 0x0F) as usize;
            if size > MAX_SINGLE_FRAME_PAYLOAD {
                return Err(malformed(bytes, format!("single frame size {} exceeds 7", size)));
            }
            if size > bytes.len() - 1 {
                return Err(malformed(
                    bytes,
                    format!("single frame declares {} bytes, carries {}", size, bytes.len() - 1),
                ));
            }
            Pci::SingleFrame {
                data: &bytes[1..1 + size],
            }
        }
        PCI_FIRST => {
            if bytes.len() < 3 {
                return Err(malformed(bytes, "first frame without payload"));
            }
            let total_length = (((bytes[0] & 0x0F) as usize) << 8) | bytes[1] as usize;
            if total_length <= MAX_SINGLE_FRAME_PAYLOAD {
                return Err(malformed(
                    bytes,
                    format!("first frame length {} fits a single frame", total_length),
                ));
            }
            Pci::FirstFrame {
                total_length,
                data: &bytes[2..],
            }
        }
        PCI_CONSECUTIVE => {
            if bytes.len() < 2 {
                return Err(malformed(bytes, "consecutive frame without payload"));
            }
            Pci::ConsecutiveFrame {
                sequence: bytes[0] & 0x0F,
                data: &bytes[1..],
            }
        }
        PCI_FLOW_CONTROL => {
            if bytes.len() < 3 {
                return Err(malformed(bytes, "flow control shorter than 3 bytes"));
            }
            let status = FlowStatus::from_nibble(bytes[0] & 0x0F).ok_or_else(|| {
                malformed(bytes, format!("flow status 0x{:X} is reserved", bytes[0] & 0x0F))
            })?;
            Pci::FlowControl {
                status,
                block_size: bytes[1],
                separation_time: bytes[2],
            }
        }
        other => Pci::Reserved { pci: other },
    };

    let service = match &pci {
        Pci::SingleFrame { data } | Pci::FirstFrame { data, .. } => service_tag(data),
        _ => None,
    };
    if let (Pci::SingleFrame { data }, Some(ServiceTag::Negative { .. })) = (&pci, service) {
        if data.len() < 3 {
            return Err(malformed(bytes, "negative response without NRC byte"));
        }
    }

    Ok(ClassifiedFrame { pci, service })
}

fn service_tag(data: &[u8]) -> Option<ServiceTag> {
    let sid = *data.first()?;
    Some(match sid {
        SID_READ_DATA_BY_IDENTIFIER_POSITIVE => ServiceTag::ReadDataPositive,
        SID_NEGATIVE_RESPONSE => ServiceTag::Negative {
            request_sid: data.get(1).copied().unwrap_or(0),
            nrc: data.get(2).copied().unwrap_or(0),
        },
        other => ServiceTag::Unexpected(other),
    })
}

fn pad(mut frame: Vec<u8>, padding: Option<u8>) -> Vec<u8> {
    if let Some(fill) = padding {
        frame.resize(CAN_DLC, fill);
    }
    frame
}

/// SingleFrame for a payload of at most 7 bytes
pub fn single_frame(payload: &[u8], padding: Option<u8>) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_SINGLE_FRAME_PAYLOAD);
    let mut frame = Vec::with_capacity(CAN_DLC);
    frame.push((PCI_SINGLE << 4) | (payload.len() as u8 & 0x0F));
    frame.extend_from_slice(payload);
    pad(frame, padding)
}

/// FirstFrame announcing `total_length` and carrying up to 6 bytes of `data`
pub fn first_frame(total_length: usize, data: &[u8], padding: Option<u8>) -> Vec<u8> {
    debug_assert!(total_length <= MAX_MESSAGE_LEN);
    let mut frame = Vec::with_capacity(CAN_DLC);
    frame.push((PCI_FIRST << 4) | ((total_length >> 8) as u8 & 0x0F));
    frame.push((total_length & 0xFF) as u8);
    frame.extend_from_slice(&data[..data.len().min(FIRST_FRAME_PAYLOAD)]);
    pad(frame, padding)
}

/// ConsecutiveFrame; only the low nibble of `sequence` goes on the wire (0x20 | seq)
pub fn consecutive_frame(sequence: u8, data: &[u8], padding: Option<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(CAN_DLC);
    frame.push((PCI_CONSECUTIVE << 4) | (sequence & 0x0F));
    frame.extend_from_slice(&data[..data.len().min(CONSECUTIVE_FRAME_PAYLOAD)]);
    pad(frame, padding)
}

pub fn flow_control_frame(
    status: FlowStatus,
    block_size: u8,
    separation_time: u8,
    padding: Option<u8>,
) -> Vec<u8> {
    pad(
        vec![
            (PCI_FLOW_CONTROL << 4) | status.to_nibble(),
            block_size,
            separation_time,
        ],
        padding,
    )
}
