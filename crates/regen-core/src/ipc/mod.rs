//! Inter-process communication between the supervisor and its workers.
//!
//! `protocol` defines the messages and their framing; `channel` runs the
//! supervisor side of each worker's stdin/stdout pipes on tokio tasks.

mod channel;
pub mod protocol;

pub use channel::{ChannelEvent, ControlChannel, WorkerEvent, attach};
pub use protocol::{
    Resource, SupervisorMessage, WorkerConfig, WorkerKind, WorkerMessage, read_message,
    read_message_async, write_message, write_message_async,
};
