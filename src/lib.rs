pub mod bus;
pub mod channel;
pub mod config;
pub mod ecu_emulator;
pub mod engine;
pub mod error;
pub mod periodic;
pub mod tp;
pub mod trace;
pub mod uds;

pub use channel::ChannelId;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use periodic::TaskHandle;
pub use uds::{Message, MessageOutcome};
