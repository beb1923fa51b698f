//! Transport abstraction
//!
//! The engine never touches a port directly. It hands outgoing bytes to a
//! [`Transport`]; incoming bytes are pushed into it by whoever owns the line.
//! The async session runner uses an [`Outbox`] and flushes it to the port.

use std::collections::VecDeque;

use super::ProtocolError;

/// Byte-level write side of the serial line
pub trait Transport {
    /// Queue or transmit `bytes`
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write(bytes)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        (**self).write(bytes)
    }
}

/// Transport that only collects writes, for an async driver to flush
#[derive(Debug, Default)]
pub struct Outbox {
    pending: VecDeque<Vec<u8>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every queued write, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.pending.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Transport for Outbox {
    fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.pending.push_back(bytes.to_vec());
        Ok(())
    }
}
