use crate::tp::frame::Pci;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyMode {
    Idle,
    AwaitingConsecutive,
    /// Left after a sequence error; only a new Single/First frame or a reset leaves it
    Error,
}

/// Result of feeding one frame to [`ReassemblyState::on_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// A full message is available; state is back to Idle
    Complete(Vec<u8>),
    /// A FirstFrame was accepted and the receiver owes the sender a FlowControl
    FlowControlDue,
    /// A ConsecutiveFrame was appended. `block_boundary` is set when the
    /// receiver's block size is exhausted and another FlowControl is owed.
    Continue { block_boundary: bool },
    /// Frame carries nothing for the receiver (stray CF, FC, reserved PCI)
    Ignored,
}

/// Partial message dropped because a new Single/First frame arrived mid-reassembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub partial: Vec<u8>,
    pub declared_total_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub progress: Progress,
    pub abandoned: Option<Abandoned>,
}

impl Step {
    fn new(progress: Progress) -> Self {
        Self {
            progress,
            abandoned: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("consecutive frame sequence {received:X}, expected {expected:X}")]
    OutOfOrder { expected: u8, received: u8 },
}

/// Receive-side state of one channel.
///
/// Owned by the channel's frame-arrival worker; nothing else mutates it.
#[derive(Debug, Clone)]
pub struct ReassemblyState {
    mode: ReassemblyMode,
    /// 4-bit sequence expected on the next ConsecutiveFrame
    expected_sequence: u8,
    bytes_remaining: usize,
    accumulated: Vec<u8>,
    declared_total_length: usize,
    /// Block size advertised in the FlowControl for the current message (0 = unlimited)
    block_size: u8,
    block_remaining: u8,
}

impl Default for ReassemblyState {
    fn default() -> Self {
        Self::new()
    }
}

impl ReassemblyState {
    pub fn new() -> Self {
        Self {
            mode: ReassemblyMode::Idle,
            expected_sequence: 0,
            bytes_remaining: 0,
            accumulated: Vec::new(),
            declared_total_length: 0,
            block_size: 0,
            block_remaining: 0,
        }
    }

    pub fn mode(&self) -> ReassemblyMode {
        self.mode
    }

    pub fn expected_sequence(&self) -> u8 {
        self.expected_sequence
    }

    pub fn bytes_remaining(&self) -> usize {
        self.bytes_remaining
    }

    pub fn declared_total_length(&self) -> usize {
        self.declared_total_length
    }

    pub fn accumulated(&self) -> &[u8] {
        &self.accumulated
    }

    pub fn in_flight(&self) -> bool {
        self.mode == ReassemblyMode::AwaitingConsecutive
    }

    /// Back to Idle, dropping any partial message
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Abort an in-flight reassembly (N_Cr expiry), returning what was collected
    pub fn abort(&mut self) -> Option<Abandoned> {
        if !self.in_flight() {
            return None;
        }
        let abandoned = self.take_partial();
        self.reset();
        abandoned
    }

    fn take_partial(&mut self) -> Option<Abandoned> {
        if !self.in_flight() {
            return None;
        }
        Some(Abandoned {
            partial: std::mem::take(&mut self.accumulated),
            declared_total_length: self.declared_total_length,
        })
    }

    /// Feed one classified frame.
    ///
    /// `block_size` is the receiver's configured block size; it is latched when
    /// a FirstFrame is accepted so a mid-message parameter change does not
    /// desynchronise the FlowControl cadence already announced to the sender.
    pub fn on_frame(&mut self, pci: &Pci<'_>, block_size: u8) -> Result<Step, ReassemblyError> {
        match *pci {
            Pci::SingleFrame { data } => {
                let abandoned = self.take_partial();
                self.reset();
                Ok(Step {
                    progress: Progress::Complete(data.to_vec()),
                    abandoned,
                })
            }
            Pci::FirstFrame { total_length, data } => {
                let abandoned = self.take_partial();
                let take = data.len().min(total_length);
                *self = Self {
                    mode: ReassemblyMode::AwaitingConsecutive,
                    expected_sequence: 1,
                    bytes_remaining: total_length - take,
                    accumulated: Vec::with_capacity(total_length),
                    declared_total_length: total_length,
                    block_size,
                    block_remaining: block_size,
                };
                self.accumulated.extend_from_slice(&data[..take]);
                Ok(Step {
                    progress: Progress::FlowControlDue,
                    abandoned,
                })
            }
            Pci::ConsecutiveFrame { sequence, data } => {
                if self.mode != ReassemblyMode::AwaitingConsecutive {
                    return Ok(Step::new(Progress::Ignored));
                }
                if sequence != self.expected_sequence & 0x0F {
                    let expected = self.expected_sequence & 0x0F;
                    self.accumulated.clear();
                    self.bytes_remaining = 0;
                    self.mode = ReassemblyMode::Error;
                    return Err(ReassemblyError::OutOfOrder {
                        expected,
                        received: sequence,
                    });
                }

                let take = data.len().min(self.bytes_remaining);
                self.accumulated.extend_from_slice(&data[..take]);
                self.bytes_remaining -= take;
                self.expected_sequence = (self.expected_sequence + 1) & 0x0F;

                if self.bytes_remaining == 0 {
                    let message = std::mem::take(&mut self.accumulated);
                    self.reset();
                    return Ok(Step::new(Progress::Complete(message)));
                }

                let mut block_boundary = false;
                if self.block_size > 0 {
                    self.block_remaining = self.block_remaining.saturating_sub(1);
                    if self.block_remaining == 0 {
                        self.block_remaining = self.block_size;
                        block_boundary = true;
                    }
                }
                Ok(Step::new(Progress::Continue { block_boundary }))
            }
            Pci::FlowControl { .. } | Pci::Reserved { .. } => Ok(Step::new(Progress::Ignored)),
        }
    }
}
