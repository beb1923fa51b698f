//! Reply decoding
//!
//! Applies register scaling rules to complete frames.

use chrono::Utc;
use tracing::trace;

use super::echo::ReplyLayout;
use super::frame::Frame;
use super::DTC_NO_MALFUNCTION;
use crate::telemetry::{DtcEntry, DtcReport, Reading, TelemetrySnapshot};

/// Decode a live-data frame against the layout it was requested with
///
/// Registers whose bytes cannot be located are left out of the snapshot.
pub fn decode_snapshot(frame: &Frame, layout: &ReplyLayout) -> TelemetrySnapshot {
    let offsets = layout.offsets();
    let mut snapshot = TelemetrySnapshot::new(layout.generation());

    for register in layout.selection().registers() {
        let Some(msb) = offsets.get(register.id).index().and_then(|i| frame.get(i)) else {
            trace!("{} not present in frame, skipping", register.name);
            continue;
        };
        let lsb = match register.lsb_id() {
            Some(lsb_id) => match offsets.get(lsb_id).index().and_then(|i| frame.get(i)) {
                Some(lsb) => Some(lsb),
                None => {
                    trace!("{} LSB not present in frame, skipping", register.name);
                    continue;
                }
            },
            None => None,
        };

        snapshot.insert(
            register.name,
            Reading {
                value: register.decode(msb, lsb),
                units: register.units,
            },
        );
    }

    snapshot
}

/// Decode a self-diagnostic reply frame
///
/// Data bytes are `(code, starts)` pairs; a trailing odd byte is ignored.
pub fn decode_dtc(frame: &Frame) -> DtcReport {
    let codes = frame
        .data()
        .chunks_exact(2)
        .map(|pair| DtcEntry {
            code: pair[0],
            starts: pair[1],
        })
        .filter(|entry| entry.code != DTC_NO_MALFUNCTION)
        .collect();

    DtcReport {
        timestamp: Utc::now(),
        codes,
    }
}
