//! ISO-TP style transport: frame classification, receive-side reassembly and
//! flow control.

pub mod flow_control;
pub mod frame;
pub mod reassembly;

pub use flow_control::{FlowControl, FlowControlParams, Segmenter};
pub use frame::{classify, ClassifiedFrame, FlowStatus, FrameKind, MalformedFrame, Pci, ServiceTag};
pub use reassembly::{ReassemblyMode, ReassemblyState};
