//! Consult Protocol Communication
//!
//! Implements the Nissan Consult half-duplex serial protocol: register
//! catalog, live-data request building, echo resolution, reply framing,
//! decoding and the session state machine that ties them together.
//!
//! The [`Engine`] is sans-IO. It writes through a [`Transport`] and is fed
//! received bytes by its owner; [`run_session`] drives it over an async
//! serial stream.

pub mod commands;
pub mod decoder;
pub mod echo;
pub mod engine;
mod error;
pub mod frame;
pub mod registers;
pub mod request;
pub mod serial;
pub mod session;
pub mod stream;

pub use commands::{
    Command, DTC_NO_MALFUNCTION, DTC_READ_SEQUENCE, FRAME_HEADER_LEN, FRAME_START, INIT_ACK,
    INIT_SEQUENCE, POLL_PREFIX, REPLY_MARKER, STOP_ACK, STOP_BYTE, TERMINATOR,
};
pub use decoder::{decode_dtc, decode_snapshot};
pub use echo::{ByteOffset, EchoFilter, OffsetTable, ReplyLayout};
pub use engine::{Engine, EngineConfig, EngineStats, SessionState, StopTrigger};
pub use error::ProtocolError;
pub use frame::{Frame, FrameAssembler};
pub use registers::{Register, ScaleRule, Width};
pub use request::{Request, RequestSelection};
pub use serial::{list_ports, open_async, PortInfo};
pub use session::{run_serial_session, run_session, SessionCommand, SessionSummary};
pub use stream::{Outbox, Transport};

/// Consult line speed
pub const DEFAULT_BAUD_RATE: u32 = 9600;
