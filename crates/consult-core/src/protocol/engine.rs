//! Session engine
//!
//! Owns all protocol state for one Consult line and sequences init,
//! live-data streaming, stop and DTC reads. It is driven by one call per
//! event (line opened, bytes received, stop or DTC trigger, line closed)
//! and never blocks.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use super::decoder::{decode_dtc, decode_snapshot};
use super::echo::{EchoFilter, ReplyLayout};
use super::frame::{Frame, FrameAssembler, DEFAULT_MAX_BUFFER_LEN};
use super::request::RequestSelection;
use super::stream::Transport;
use super::{Command, ProtocolError, INIT_ACK, STOP_ACK};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Line closed
    Disconnected,
    /// Init sequence sent, waiting for the ECU to acknowledge
    Initializing,
    /// Live-data request sent, frames are decoded
    Streaming,
    /// Stop sent, waiting for the stop acknowledgment
    StopRequested,
    /// DTC read sent, waiting for the report frame
    DtcRequested,
}

/// What asked for the stream to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTrigger {
    /// Explicit stop; streaming resumes with the current selection
    User,
    /// Periodic DTC read
    DtcTimer,
}

/// Engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on buffered bytes that have not formed a frame
    pub max_buffer_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_buffer_len: DEFAULT_MAX_BUFFER_LEN,
        }
    }
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    /// Complete frames assembled
    pub frames: u64,
    /// Snapshots published
    pub snapshots: u64,
    /// Frames dropped because the selection changed under them
    pub stale_frames: u64,
    /// Frames whose data length does not match the request
    pub malformed_frames: u64,
    /// Stream buffer resets after exceeding the bound
    pub overflows: u64,
    pub echo_mismatches: u64,
}

/// Consult protocol engine
pub struct Engine<T: Transport, S: TelemetrySink> {
    transport: T,
    sink: S,
    state: SessionState,
    layout: ReplyLayout,
    /// Generation of the layout the last live-data request was built from
    live_generation: u64,
    assembler: FrameAssembler,
    echo: EchoFilter,
    stop_pending: bool,
    dtc_pending: bool,
    stats: EngineStats,
}

impl<T: Transport, S: TelemetrySink> Engine<T, S> {
    /// Create an engine for a selection; the line is not open yet
    pub fn new(selection: RequestSelection, transport: T, sink: S, config: EngineConfig) -> Self {
        Self {
            transport,
            sink,
            state: SessionState::Disconnected,
            layout: ReplyLayout::resolve(selection, 1),
            live_generation: 0,
            assembler: FrameAssembler::new(config.max_buffer_len),
            echo: EchoFilter::new(),
            stop_pending: false,
            dtc_pending: false,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Request, echo and offsets of the current selection
    pub fn layout(&self) -> &ReplyLayout {
        &self.layout
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            echo_mismatches: self.echo.mismatches(),
            overflows: self.assembler.overflows(),
            ..self.stats
        }
    }

    pub fn is_stop_pending(&self) -> bool {
        self.stop_pending
    }

    pub fn is_dtc_pending(&self) -> bool {
        self.dtc_pending
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Give back transport and sink
    pub fn into_parts(self) -> (T, S) {
        (self.transport, self.sink)
    }

    /// The line has been opened: start a session
    pub fn on_open(&mut self) -> Result<(), ProtocolError> {
        if self.state != SessionState::Disconnected {
            return Err(ProtocolError::AlreadyConnected);
        }
        info!("Line open, initialising ECU");
        self.assembler.reset();
        self.echo.clear();
        self.state = SessionState::Initializing;
        self.send_command(Command::Init)
    }

    /// The line has been closed: drop all in-flight state
    ///
    /// The selection and its layout survive; they do not depend on the line.
    pub fn on_close(&mut self) {
        if self.state != SessionState::Disconnected {
            info!("Line closed in state {:?}", self.state);
        }
        self.state = SessionState::Disconnected;
        self.stop_pending = false;
        self.dtc_pending = false;
        self.assembler.reset();
        self.echo.clear();
    }

    /// Bytes arrived from the ECU
    ///
    /// Malformed or truncated data never fails; the worst case is a
    /// dropped frame. Only transport failures are returned.
    pub fn on_data(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.stats.rx_bytes += chunk.len() as u64;

        match self.state {
            SessionState::Disconnected => {
                debug!("Ignoring {} bytes while disconnected", chunk.len());
                Ok(())
            }
            SessionState::Initializing => {
                if chunk.contains(&INIT_ACK) {
                    info!("ECU initialised");
                    self.assembler.reset();
                    self.request_live_data()
                } else {
                    debug!("Waiting for init ack, got {:02x?}", chunk);
                    Ok(())
                }
            }
            SessionState::StopRequested => self.await_stop_ack(chunk),
            SessionState::Streaming | SessionState::DtcRequested => {
                let rest = self.echo.filter(chunk);
                let frames = match self.assembler.ingest(rest) {
                    Ok(frames) => frames,
                    Err(e) => {
                        warn!("{}, stream buffer reset", e);
                        return Ok(());
                    }
                };
                for frame in frames {
                    self.stats.frames += 1;
                    self.handle_frame(frame)?;
                    if !matches!(
                        self.state,
                        SessionState::Streaming | SessionState::DtcRequested
                    ) {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Stop the stream on user request
    pub fn request_stop(&mut self) -> Result<(), ProtocolError> {
        self.stop(StopTrigger::User)
    }

    /// Periodic DTC trigger
    pub fn request_dtc(&mut self) -> Result<(), ProtocolError> {
        self.stop(StopTrigger::DtcTimer)
    }

    /// Replace the selection
    ///
    /// Request, echo and offsets are recomputed together under a new
    /// generation. While streaming, the stream is stopped so the new request
    /// goes out once the ECU acknowledges.
    pub fn set_selection(&mut self, selection: RequestSelection) -> Result<(), ProtocolError> {
        let generation = self.layout.generation() + 1;
        info!(
            "Selection changed to {:?} (gen {})",
            selection.names(),
            generation
        );
        self.layout = ReplyLayout::resolve(selection, generation);
        if self.state == SessionState::Streaming {
            self.stop(StopTrigger::User)?;
        }
        Ok(())
    }

    /// Enter `StopRequested`, coalescing with a stop already in flight
    fn stop(&mut self, trigger: StopTrigger) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Disconnected => Err(ProtocolError::NotConnected),
            SessionState::Streaming => {
                debug!("Stopping stream ({:?})", trigger);
                self.begin_stop(trigger == StopTrigger::DtcTimer)
            }
            SessionState::StopRequested => {
                if trigger == StopTrigger::DtcTimer && !self.dtc_pending {
                    debug!("DTC read folded into pending stop");
                    self.dtc_pending = true;
                } else {
                    debug!("Stop already pending ({:?})", trigger);
                }
                Ok(())
            }
            // The ECU repeats its report until stopped, frame or not
            SessionState::DtcRequested if trigger == StopTrigger::User => {
                debug!("Stopping DTC read");
                self.begin_stop(false)
            }
            SessionState::Initializing | SessionState::DtcRequested => {
                debug!("Ignoring {:?} stop in state {:?}", trigger, self.state);
                Ok(())
            }
        }
    }

    fn begin_stop(&mut self, read_dtc: bool) -> Result<(), ProtocolError> {
        self.stop_pending = true;
        self.dtc_pending = read_dtc;
        self.state = SessionState::StopRequested;
        self.assembler.reset();
        self.echo.clear();
        self.send_command(Command::Stop)
    }

    /// Scan for the stop acknowledgment; nothing is buffered meanwhile
    fn await_stop_ack(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        if !chunk.contains(&STOP_ACK) {
            trace!("Discarding {} bytes while waiting for stop ack", chunk.len());
            return Ok(());
        }

        debug!("Stop acknowledged");
        self.stop_pending = false;

        if self.dtc_pending {
            self.dtc_pending = false;
            self.state = SessionState::DtcRequested;
            self.send_command(Command::ReadDtc)
        } else {
            self.request_live_data()
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        match self.state {
            SessionState::Streaming => {
                if frame.generation() != self.layout.generation() {
                    debug!(
                        "Dropping frame from gen {} (current gen {})",
                        frame.generation(),
                        self.layout.generation()
                    );
                    self.stats.stale_frames += 1;
                    return Ok(());
                }
                let polls = self.layout.request().poll_count();
                if frame.data().len() != polls {
                    warn!(
                        "Dropping frame with {} data bytes, {} registers polled",
                        frame.data().len(),
                        polls
                    );
                    self.stats.malformed_frames += 1;
                    return Ok(());
                }
                let snapshot = decode_snapshot(&frame, &self.layout);
                self.stats.snapshots += 1;
                self.sink.publish(TelemetryEvent::Snapshot(snapshot));
                Ok(())
            }
            SessionState::DtcRequested => {
                let report = decode_dtc(&frame);
                info!("DTC report: {} codes", report.codes.len());
                self.sink.publish(TelemetryEvent::Dtc(report));
                // The ECU repeats the report until stopped
                self.begin_stop(false)
            }
            _ => Ok(()),
        }
    }

    fn request_live_data(&mut self) -> Result<(), ProtocolError> {
        self.live_generation = self.layout.generation();
        self.assembler.set_generation(self.live_generation);
        self.echo.arm(self.layout.echo_prefix());
        self.state = SessionState::Streaming;
        self.send_command(Command::LiveData)
    }

    fn send_command(&mut self, command: Command) -> Result<(), ProtocolError> {
        let bytes = match command.fixed_bytes() {
            Some(bytes) => bytes,
            None => self.layout.request().as_bytes(),
        };
        debug!("Sending {:?}: {:02x?}", command, bytes);
        if let Err(e) = self.transport.write(bytes) {
            warn!("Write of {:?} failed: {}", command, e);
            self.on_close();
            return Err(match e {
                ProtocolError::TransportError(_) => e,
                other => ProtocolError::TransportError(other.to_string()),
            });
        }
        self.stats.tx_bytes += bytes.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingTransport {
        writes: Vec<Vec<u8>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
            if self.fail {
                return Err(ProtocolError::TransportError("write failed".into()));
            }
            self.writes.push(bytes.to_vec());
            Ok(())
        }
    }

    type TestEngine = Engine<RecordingTransport, Vec<TelemetryEvent>>;

    fn engine(ids: &[u8]) -> TestEngine {
        engine_with(ids, EngineConfig::default())
    }

    fn engine_with(ids: &[u8], config: EngineConfig) -> TestEngine {
        Engine::new(
            RequestSelection::from_ids(ids).unwrap(),
            RecordingTransport::default(),
            Vec::new(),
            config,
        )
    }

    fn streaming(ids: &[u8]) -> TestEngine {
        streaming_with(ids, EngineConfig::default())
    }

    fn streaming_with(ids: &[u8], config: EngineConfig) -> TestEngine {
        let mut engine = engine_with(ids, config);
        engine.on_open().unwrap();
        engine.on_data(&[INIT_ACK]).unwrap();
        engine.transport_mut().writes.clear();
        engine
    }

    #[test]
    fn test_open_sends_init() {
        let mut engine = engine(&[0x08]);
        engine.on_open().unwrap();
        assert_eq!(engine.state(), SessionState::Initializing);
        assert_eq!(engine.transport().writes, vec![vec![0xFF, 0xFF, 0xEF]]);
        assert!(matches!(engine.on_open(), Err(ProtocolError::AlreadyConnected)));
    }

    #[test]
    fn test_init_ack_starts_stream_once() {
        let mut engine = engine(&[0x08]);
        engine.on_open().unwrap();
        engine.on_data(&[0x00, INIT_ACK]).unwrap();
        assert_eq!(engine.state(), SessionState::Streaming);
        engine.on_data(&[INIT_ACK]).unwrap();
        assert_eq!(
            engine.transport().writes,
            vec![vec![0xFF, 0xFF, 0xEF], vec![0x5A, 0x08, 0xF0]]
        );
    }

    #[test]
    fn test_frame_decoded_after_echo() {
        let mut engine = streaming(&[0x08, 0x0B]);
        engine.on_data(&[0xA5, 0x08, 0xA5]).unwrap();
        engine.on_data(&[0x0B, 0xFF, 0x02, 0x64]).unwrap();
        assert!(engine.sink().is_empty());
        engine.on_data(&[0x32]).unwrap();

        let events = engine.sink();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TelemetryEvent::Snapshot(s) => {
                assert_eq!(s.get("coolant_temp"), Some(50.0));
                assert_eq!(s.get("speed"), Some(100.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.stats().frames, 1);
        assert_eq!(engine.stats().echo_mismatches, 0);
    }

    #[test]
    fn test_user_stop_resumes_streaming() {
        let mut engine = streaming(&[0x08]);
        engine.request_stop().unwrap();
        assert_eq!(engine.state(), SessionState::StopRequested);
        assert!(engine.is_stop_pending());
        engine.request_stop().unwrap();

        engine.on_data(&[0xFF, 0x01, STOP_ACK]).unwrap();
        assert_eq!(engine.state(), SessionState::Streaming);
        assert!(!engine.is_stop_pending());
        assert_eq!(
            engine.transport().writes,
            vec![vec![0x30], vec![0x5A, 0x08, 0xF0]]
        );
    }

    #[test]
    fn test_dtc_coalesced_with_user_stop() {
        let mut engine = streaming(&[0x08]);
        engine.request_stop().unwrap();
        engine.request_dtc().unwrap();
        engine.request_dtc().unwrap();
        assert!(engine.is_dtc_pending());

        engine.on_data(&[STOP_ACK]).unwrap();
        assert_eq!(engine.state(), SessionState::DtcRequested);
        assert_eq!(
            engine.transport().writes,
            vec![vec![0x30], vec![0xD1, 0xF0]]
        );
    }

    #[test]
    fn test_dtc_report_then_resume() {
        let mut engine = streaming(&[0x08]);
        engine.request_dtc().unwrap();
        engine.on_data(&[STOP_ACK]).unwrap();
        engine.on_data(&[0x2E, 0xFF, 0x02, 0x21, 0x04]).unwrap();

        assert!(matches!(
            engine.sink().last(),
            Some(TelemetryEvent::Dtc(report)) if report.codes.len() == 1
        ));
        assert_eq!(engine.state(), SessionState::StopRequested);

        engine.on_data(&[STOP_ACK]).unwrap();
        assert_eq!(engine.state(), SessionState::Streaming);
        assert_eq!(
            engine.transport().writes,
            vec![
                vec![0x30],
                vec![0xD1, 0xF0],
                vec![0x30],
                vec![0x5A, 0x08, 0xF0]
            ]
        );
    }

    #[test]
    fn test_selection_change_restarts_stream() {
        let mut engine = streaming(&[0x08]);
        engine.set_selection(RequestSelection::from_ids(&[0x0B]).unwrap()).unwrap();
        assert_eq!(engine.layout().generation(), 2);
        assert_eq!(engine.state(), SessionState::StopRequested);

        engine.on_data(&[STOP_ACK]).unwrap();
        assert_eq!(
            engine.transport().writes,
            vec![vec![0x30], vec![0x5A, 0x0B, 0xF0]]
        );

        engine.on_data(&[0xA5, 0x0B, 0xFF, 0x01, 0x32]).unwrap();
        match engine.sink().last() {
            Some(TelemetryEvent::Snapshot(s)) => {
                assert_eq!(s.generation, 2);
                assert_eq!(s.get("speed"), Some(100.0));
                assert_eq!(s.get("coolant_temp"), None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_close_discards_partial_frame() {
        let mut engine = streaming(&[0x08]);
        engine.on_data(&[0xA5, 0x08, 0xFF, 0x01]).unwrap();
        engine.on_close();
        assert_eq!(engine.state(), SessionState::Disconnected);

        engine.on_data(&[0x64]).unwrap();
        assert!(engine.sink().is_empty());
        assert_eq!(engine.layout().generation(), 1);
        assert!(matches!(engine.request_stop(), Err(ProtocolError::NotConnected)));
    }

    #[test]
    fn test_write_failure_disconnects() {
        let mut engine = engine(&[0x08]);
        engine.transport_mut().fail = true;
        assert!(matches!(
            engine.on_open(),
            Err(ProtocolError::TransportError(_))
        ));
        assert_eq!(engine.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_stop_ack_beyond_buffer_bound() {
        let mut engine = streaming_with(&[0x08], EngineConfig { max_buffer_len: 16 });
        engine.request_stop().unwrap();
        for _ in 0..255 {
            engine.on_data(&[0xFF, 0x02, 0x01, 0x20]).unwrap();
        }
        engine.on_data(&[0xFF, 0x02, 0x01, 0x20, STOP_ACK]).unwrap();

        assert_eq!(engine.state(), SessionState::Streaming);
        assert_eq!(
            engine.transport().writes,
            vec![vec![0x30], vec![0x5A, 0x08, 0xF0]]
        );
    }

    #[test]
    fn test_user_stop_during_dtc_read() {
        let mut engine = streaming(&[0x08]);
        engine.request_dtc().unwrap();
        engine.on_data(&[STOP_ACK]).unwrap();
        // Reply bytes that never form a frame
        engine.on_data(&[0x2E, 0x00, 0x00]).unwrap();
        assert_eq!(engine.state(), SessionState::DtcRequested);

        // A read is already in flight
        engine.request_dtc().unwrap();
        assert_eq!(engine.transport().writes.len(), 2);

        engine.request_stop().unwrap();
        assert_eq!(engine.state(), SessionState::StopRequested);
        assert!(!engine.is_dtc_pending());

        engine.on_data(&[STOP_ACK]).unwrap();
        assert_eq!(engine.state(), SessionState::Streaming);
        assert_eq!(
            engine.transport().writes,
            vec![
                vec![0x30],
                vec![0xD1, 0xF0],
                vec![0x30],
                vec![0x5A, 0x08, 0xF0]
            ]
        );
    }

    #[test]
    fn test_frame_from_old_generation_is_dropped() {
        let mut engine = streaming(&[0x08]);
        engine.on_data(&[0xA5, 0x08]).unwrap();

        engine
            .handle_frame(Frame::new(vec![0xFF, 0x01, 0x64], 0))
            .unwrap();
        assert!(engine.sink().is_empty());
        assert_eq!(engine.stats().stale_frames, 1);

        engine.on_data(&[0xFF, 0x01, 0x64]).unwrap();
        assert_eq!(engine.sink().len(), 1);
    }

    #[test]
    fn test_overflow_is_counted_and_stream_recovers() {
        let mut engine = streaming_with(&[0x08], EngineConfig { max_buffer_len: 8 });
        engine.on_data(&[0xA5, 0x08]).unwrap();

        // Declares 254 data bytes, more than the bound
        engine
            .on_data(&[0xFF, 0xFE, 1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        assert_eq!(engine.stats().overflows, 1);
        assert!(engine.sink().is_empty());

        engine.on_data(&[0xFF, 0x01, 0x64]).unwrap();
        match engine.sink().last() {
            Some(TelemetryEvent::Snapshot(s)) => assert_eq!(s.get("coolant_temp"), Some(50.0)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(engine.state(), SessionState::Streaming);
    }

    #[test]
    fn test_overflow_after_frame_in_same_chunk() {
        let mut engine = streaming_with(&[0x08], EngineConfig { max_buffer_len: 8 });
        engine.on_data(&[0xA5, 0x08]).unwrap();

        engine
            .on_data(&[0xFF, 0x01, 0x64, 0xFF, 0xFE, 1, 2, 3, 4, 5, 6, 7, 8])
            .unwrap();
        assert_eq!(engine.sink().len(), 1);
        assert_eq!(engine.stats().overflows, 1);
    }

    #[test]
    fn test_frame_length_mismatch_is_dropped() {
        let mut engine = streaming(&[0x00]);
        engine.on_data(&[0xA5, 0x00, 0xA5, 0x01]).unwrap();

        engine
            .on_data(&[0xFF, 0x05, 0x11, 0x22, 0x33, 0x44, 0x55])
            .unwrap();
        assert!(engine.sink().is_empty());
        assert_eq!(engine.stats().malformed_frames, 1);

        engine.on_data(&[0xFF, 0x02, 0x00, 0x50]).unwrap();
        match engine.sink().last() {
            Some(TelemetryEvent::Snapshot(s)) => assert_eq!(s.get("rpm"), Some(1000.0)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
