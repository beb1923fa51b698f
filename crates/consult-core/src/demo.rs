//! Demo Mode - Simulated Consult ECU
//!
//! Speaks the ECU side of the protocol at byte level so a session can run
//! without a car attached: answers init, echoes live-data requests and then
//! streams frames, acknowledges stops and reports trouble codes.
//! Register values default to a warm engine at idle.

use std::collections::HashMap;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::registers::{self, Width};
use crate::protocol::{
    Command, ProtocolError, DTC_NO_MALFUNCTION, FRAME_START, INIT_ACK, POLL_PREFIX, REPLY_MARKER,
    STOP_ACK, TERMINATOR,
};
use crate::telemetry::DtcEntry;

/// What the simulated ECU is currently doing
#[derive(Debug, Clone, PartialEq, Eq)]
enum EcuState {
    /// Waiting for the init sequence
    Asleep,
    /// Initialised, no stream running
    Ready,
    /// Streaming the polled ids
    Streaming(Vec<u8>),
    /// Repeating the self-diagnostic report
    Diagnostics,
}

/// Raw bytes per id for a warm engine at idle: 850 rpm, 90 °C coolant,
/// stationary, 13.6 V, 25 °C intake
const IDLE_VALUES: [(u8, u8); 17] = [
    (0x00, 0x00),
    (0x01, 68),
    (0x02, 0x00),
    (0x03, 106),
    (0x04, 0x01),
    (0x05, 0x04),
    (0x08, 140),
    (0x09, 45),
    (0x0B, 0),
    (0x0C, 17),
    (0x0D, 24),
    (0x11, 75),
    (0x14, 0x00),
    (0x15, 250),
    (0x16, 95),
    (0x17, 60),
    (0x1A, 100),
];

/// Outcome of parsing the head of the receive buffer
#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    Complete {
        command: Command,
        ids: Vec<u8>,
        consumed: usize,
    },
    Incomplete,
    Garbage,
}

/// Byte-level Consult ECU simulator
pub struct SimulatedEcu {
    state: EcuState,
    /// Raw byte per register id (MSB and LSB ids separately)
    values: HashMap<u8, u8>,
    dtcs: Vec<DtcEntry>,
    rx: Vec<u8>,
    received: Vec<Command>,
    jitter: Option<StdRng>,
}

impl Default for SimulatedEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedEcu {
    /// Create a simulator with idle engine values and no stored codes
    pub fn new() -> Self {
        Self {
            state: EcuState::Asleep,
            values: HashMap::from(IDLE_VALUES),
            dtcs: Vec::new(),
            rx: Vec::new(),
            received: Vec::new(),
            jitter: None,
        }
    }

    /// Add ±1 count of noise to every streamed byte, reproducible per seed
    pub fn with_jitter(mut self, seed: u64) -> Self {
        self.jitter = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Set the raw value of a register
    ///
    /// Dual-byte registers take the full 16 bit value; single-byte registers
    /// saturate at 255.
    pub fn set_register(&mut self, id: u8, raw: u16) -> Result<(), ProtocolError> {
        let register = registers::lookup(id).ok_or(ProtocolError::UnknownRegister(id))?;
        match register.width {
            Width::One => {
                self.values
                    .insert(id, u8::try_from(raw).unwrap_or(u8::MAX));
            }
            Width::Two => {
                let mut pair = [0u8; 2];
                BigEndian::write_u16(&mut pair, raw);
                self.values.insert(id, pair[0]);
                self.values.insert(id + 1, pair[1]);
            }
        }
        Ok(())
    }

    /// Replace the stored trouble codes
    pub fn set_dtcs(&mut self, dtcs: Vec<DtcEntry>) {
        self.dtcs = dtcs;
    }

    /// Commands accepted so far, oldest first
    pub fn received(&self) -> &[Command] {
        &self.received
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, EcuState::Streaming(_))
    }

    /// Feed bytes sent by the host; returns the immediate reply
    ///
    /// Commands may be split across calls. Anything before init, and bytes
    /// that do not start a known command, are dropped.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<u8> {
        self.rx.extend_from_slice(bytes);
        let mut reply = Vec::new();

        while !self.rx.is_empty() {
            match parse(&self.rx) {
                Parsed::Incomplete => break,
                Parsed::Garbage => {
                    trace!("Dropping stray byte {:02x}", self.rx[0]);
                    self.rx.remove(0);
                }
                Parsed::Complete {
                    command,
                    ids,
                    consumed,
                } => {
                    self.rx.drain(..consumed);
                    self.execute(command, ids, &mut reply);
                }
            }
        }
        reply
    }

    fn execute(&mut self, command: Command, ids: Vec<u8>, reply: &mut Vec<u8>) {
        if self.state == EcuState::Asleep && command != Command::Init {
            debug!("Ignoring {:?} before init", command);
            return;
        }
        debug!("ECU received {:?}", command);
        self.received.push(command);

        match command {
            Command::Init => {
                self.state = EcuState::Ready;
                reply.push(INIT_ACK);
            }
            Command::Stop => {
                self.state = EcuState::Ready;
                reply.push(STOP_ACK);
            }
            Command::ReadDtc => self.state = EcuState::Diagnostics,
            Command::LiveData => {
                reply.extend(ids.iter().flat_map(|&id| [REPLY_MARKER, id]));
                self.state = EcuState::Streaming(ids);
            }
        }
    }

    /// Next periodic frame, if a stream is running
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let data: Vec<u8> = match &self.state {
            EcuState::Streaming(ids) => {
                let ids = ids.clone();
                ids.iter()
                    .map(|id| {
                        let value = self.values.get(id).copied().unwrap_or(0);
                        self.wobble(value)
                    })
                    .collect()
            }
            EcuState::Diagnostics if self.dtcs.is_empty() => vec![DTC_NO_MALFUNCTION, 0],
            EcuState::Diagnostics => self
                .dtcs
                .iter()
                .flat_map(|dtc| [dtc.code, dtc.starts])
                .collect(),
            EcuState::Asleep | EcuState::Ready => return None,
        };

        let mut frame = Vec::with_capacity(data.len() + 2);
        frame.push(FRAME_START);
        frame.push(u8::try_from(data.len()).unwrap_or(u8::MAX));
        frame.extend(data);
        Some(frame)
    }

    fn wobble(&mut self, value: u8) -> u8 {
        match self.jitter.as_mut() {
            Some(rng) => value.saturating_add_signed(rng.gen_range(-1i8..=1)),
            None => value,
        }
    }

    /// Serve the host on `io` until cancelled or the host hangs up
    ///
    /// While a stream runs, one frame goes out every `frame_interval`.
    pub async fn serve<IO>(
        mut self,
        io: IO,
        frame_interval: Duration,
        cancel: CancellationToken,
    ) -> std::io::Result<Self>
    where
        IO: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(io);
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buf = [0u8; 256];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        debug!("Host hung up");
                        break;
                    }
                    let reply = self.receive(&buf[..n]);
                    if !reply.is_empty() {
                        writer.write_all(&reply).await?;
                        writer.flush().await?;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(frame) = self.next_frame() {
                        writer.write_all(&frame).await?;
                        writer.flush().await?;
                    }
                }
            }
        }
        Ok(self)
    }
}

fn parse(buf: &[u8]) -> Parsed {
    for command in [Command::Init, Command::Stop, Command::ReadDtc] {
        let Some(seq) = command.fixed_bytes() else {
            continue;
        };
        if buf.starts_with(seq) {
            return Parsed::Complete {
                command,
                ids: Vec::new(),
                consumed: seq.len(),
            };
        }
        if seq.starts_with(buf) {
            return Parsed::Incomplete;
        }
    }

    if buf.first() != Some(&POLL_PREFIX) {
        return Parsed::Garbage;
    }

    let mut ids = Vec::new();
    let mut i = 0;
    loop {
        match buf.get(i) {
            Some(&POLL_PREFIX) => match buf.get(i + 1) {
                Some(&id) => {
                    ids.push(id);
                    i += 2;
                }
                None => return Parsed::Incomplete,
            },
            Some(&TERMINATOR) => {
                return Parsed::Complete {
                    command: Command::LiveData,
                    ids,
                    consumed: i + 1,
                }
            }
            Some(_) => return Parsed::Garbage,
            None => return Parsed::Incomplete,
        }
    }
}
