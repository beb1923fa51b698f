//! # Consult Core Library
//!
//! Host side of the Nissan Consult diagnostic protocol.

#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The Consult register catalog and live-data request builder
//! - Echo/offset resolution and reply frame assembly for the half-duplex line
//! - A sans-IO session engine (init, streaming, stop, trouble code reads)
//! - An async session runner over `tokio-serial`
//! - A simulated ECU for demo mode and testing
//!
//! ## Example
//!
//! ```rust,ignore
//! use consult_core::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = ConsultConfig::load("consult.json")?;
//! let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let (_commands, commands_rx) = tokio::sync::mpsc::unbounded_channel();
//! let cancel = CancellationToken::new();
//!
//! tokio::spawn(run_serial_session(&config, events, commands_rx, cancel));
//! while let Some(TelemetryEvent::Snapshot(s)) = rx.recv().await {
//!     println!("RPM: {:?}", s.get("rpm"));
//! }
//! ```

pub mod config;
pub mod demo;
pub mod protocol;
pub mod telemetry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, ConsultConfig};
    pub use crate::demo::SimulatedEcu;
    pub use crate::protocol::{
        run_serial_session, run_session, Engine, EngineConfig, ProtocolError, RequestSelection,
        SessionCommand, SessionState, SessionSummary,
    };
    pub use crate::telemetry::{
        DtcEntry, DtcReport, Reading, TelemetryEvent, TelemetrySink, TelemetrySnapshot,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
