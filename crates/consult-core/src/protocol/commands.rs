//! Protocol commands
//!
//! Fixed command sequences and sentinels of the Consult protocol.

use serde::{Deserialize, Serialize};

/// Initialisation sequence, sent once when the line is opened
pub const INIT_SEQUENCE: [u8; 3] = [0xFF, 0xFF, 0xEF];

/// Stop command, ends whatever stream the ECU is currently sending
pub const STOP_BYTE: u8 = 0x30;

/// Self-diagnostic (DTC) read command followed by the terminator
pub const DTC_READ_SEQUENCE: [u8; 2] = [0xD1, 0xF0];

/// Sent by the ECU once the init sequence has been accepted
pub const INIT_ACK: u8 = 0x10;

/// Sent by the ECU once a stop command has been accepted
pub const STOP_ACK: u8 = 0xCF;

/// Precedes every register id in a live-data request
pub const POLL_PREFIX: u8 = 0x5A;

/// What the ECU echoes back in place of [`POLL_PREFIX`]
pub const REPLY_MARKER: u8 = 0xA5;

/// Ends a request
pub const TERMINATOR: u8 = 0xF0;

/// First byte of every reply frame
pub const FRAME_START: u8 = 0xFF;

/// Start marker plus length byte
pub const FRAME_HEADER_LEN: usize = 2;

/// DTC code the ECU reports when no malfunction is stored
pub const DTC_NO_MALFUNCTION: u8 = 0x55;

/// Commands the host issues to the ECU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Wake the ECU and start a diagnostic session
    Init,

    /// Stop the current stream
    Stop,

    /// Read stored diagnostic trouble codes
    ReadDtc,

    /// Poll the selected registers (bytes come from the request builder)
    LiveData,
}

impl Command {
    /// Fixed wire bytes for this command, `None` for [`Command::LiveData`]
    pub fn fixed_bytes(&self) -> Option<&'static [u8]> {
        match self {
            Command::Init => Some(&INIT_SEQUENCE),
            Command::Stop => Some(&[STOP_BYTE]),
            Command::ReadDtc => Some(&DTC_READ_SEQUENCE),
            Command::LiveData => None,
        }
    }
}
