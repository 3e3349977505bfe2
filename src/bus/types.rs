use std::fmt;

use crossbeam_channel::Receiver;

use crate::trace::hex;

/// Classic CAN payload size
pub const CAN_DLC: usize = 8;

/// Fill byte used when padding is enabled and no other value is configured
pub const DEFAULT_PADDING: u8 = 0x00;

/// Largest 11-bit identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest 29-bit identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// A raw CAN data frame as seen on the bus
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub can_id: u32,
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(can_id: u32, data: &[u8]) -> Self {
        Self {
            can_id,
            data: data.to_vec(),
        }
    }

    pub fn is_extended(&self) -> bool {
        self.can_id > MAX_STANDARD_ID
    }

    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("can_id", &format_args!("0x{:03X}", self.can_id))
            .field("data", &format_args!("[{}]", hex(&self.data)))
            .finish()
    }
}

/// Live subscription handed out by a [`crate::bus::Bus`]
///
/// Frames matching the subscribed (namespace, CAN id) pair arrive on `frames`
/// in bus order. Dropping the bus side closes the receiver.
pub struct Subscription {
    pub handle: u32,
    pub frames: Receiver<CanFrame>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish()
    }
}
