//! Telemetry output
//!
//! Decoded values handed from the protocol engine to whoever displays,
//! logs or forwards them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// A decoded register value
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// Physical value
    pub value: f64,
    /// Physical units
    pub units: &'static str,
}

/// Register values decoded from one reply frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// When the frame was decoded
    pub timestamp: DateTime<Utc>,
    /// Layout generation the frame was decoded against
    pub generation: u64,
    readings: BTreeMap<&'static str, Reading>,
}

impl TelemetrySnapshot {
    pub fn new(generation: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            generation,
            readings: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, name: &'static str, reading: Reading) {
        self.readings.insert(name, reading);
    }

    /// Physical value of a register, by name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings.get(name).map(|r| r.value)
    }

    /// Value and units of a register, by name
    pub fn reading(&self, name: &str) -> Option<&Reading> {
        self.readings.get(name)
    }

    /// All readings ordered by register name
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Reading)> {
        self.readings.iter().map(|(name, reading)| (*name, reading))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// A stored trouble code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcEntry {
    /// Two-digit Consult code, e.g. `0x21` for code 21
    pub code: u8,
    /// Engine starts since the fault was last seen
    pub starts: u8,
}

/// Result of a self-diagnostic read
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DtcReport {
    pub timestamp: DateTime<Utc>,
    pub codes: Vec<DtcEntry>,
}

impl DtcReport {
    /// Whether the ECU reported no malfunction
    pub fn is_clear(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Something the engine publishes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Snapshot(TelemetrySnapshot),
    Dtc(DtcReport),
}

/// Receiver of decoded telemetry
pub trait TelemetrySink {
    fn publish(&mut self, event: TelemetryEvent);
}

impl TelemetrySink for Vec<TelemetryEvent> {
    fn publish(&mut self, event: TelemetryEvent) {
        self.push(event);
    }
}

impl TelemetrySink for UnboundedSender<TelemetryEvent> {
    fn publish(&mut self, event: TelemetryEvent) {
        if self.send(event).is_err() {
            tracing::trace!("Telemetry receiver dropped, discarding event");
        }
    }
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for &mut S {
    fn publish(&mut self, event: TelemetryEvent) {
        (**self).publish(event);
    }
}

impl<S: TelemetrySink + ?Sized> TelemetrySink for Box<S> {
    fn publish(&mut self, event: TelemetryEvent) {
        (**self).publish(event);
    }
}
