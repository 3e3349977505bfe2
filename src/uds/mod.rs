pub mod client;
pub mod correlator;
pub mod error;
pub mod services;

pub use client::UdsClient;
pub use correlator::{Message, MessageOutcome};
pub use error::NegativeResponseCode;
