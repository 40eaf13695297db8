//! Library surface for edr_agent: command dispatch, response actions, transports and telemetry.
//! The binary in `main.rs` wires these together; integration tests drive them directly.

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod executor;
pub mod host;
pub mod http;
pub mod poller;
pub mod producer;
pub mod push;
pub mod shutdown;
pub mod telemetry;
pub mod types;

pub use dispatch::Dispatcher;
pub use error::{ConfigError, TransportError};
pub use types::{ActionOutcome, CommandEnvelope, ResponseEnvelope};
