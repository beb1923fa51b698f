//! Async sessions against the simulated ECU over an in-memory line

use std::time::Duration;

use consult_core::prelude::*;
use consult_core::protocol::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const FRAME_INTERVAL: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(5);

type SessionTask = JoinHandle<Result<SessionSummary<mpsc::UnboundedSender<TelemetryEvent>>, ProtocolError>>;

struct Harness {
    events: mpsc::UnboundedReceiver<TelemetryEvent>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    cancel: CancellationToken,
    session: SessionTask,
    ecu: JoinHandle<std::io::Result<SimulatedEcu>>,
}

fn start(ecu: SimulatedEcu, config: ConsultConfig) -> Harness {
    let (host, ecu_side) = tokio::io::duplex(1024);
    let cancel = CancellationToken::new();
    let (events_tx, events) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();

    let ecu = tokio::spawn(ecu.serve(ecu_side, FRAME_INTERVAL, cancel.clone()));
    let session = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_session(host, &config, events_tx, commands_rx, cancel).await }
    });

    Harness {
        events,
        commands,
        cancel,
        session,
        ecu,
    }
}

impl Harness {
    /// Wait for the first event the predicate accepts
    async fn wait_for<F>(&mut self, mut accept: F) -> TelemetryEvent
    where
        F: FnMut(&TelemetryEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.expect("session ended early");
                if accept(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    async fn snapshot(&mut self) -> TelemetrySnapshot {
        match self
            .wait_for(|e| matches!(e, TelemetryEvent::Snapshot(_)))
            .await
        {
            TelemetryEvent::Snapshot(s) => s,
            _ => unreachable!(),
        }
    }

    async fn finish(self) -> (SessionSummary<mpsc::UnboundedSender<TelemetryEvent>>, SimulatedEcu) {
        self.cancel.cancel();
        let summary = self.session.await.unwrap().unwrap();
        let ecu = self.ecu.await.unwrap().unwrap();
        (summary, ecu)
    }
}

#[tokio::test]
async fn test_session_streams_snapshots() {
    let mut ecu = SimulatedEcu::new();
    ecu.set_register(0x08, 100).unwrap();
    ecu.set_register(0x00, 68).unwrap();

    let config = ConsultConfig {
        registers: vec!["coolant_temp".into(), "rpm".into()],
        ..Default::default()
    };
    let mut harness = start(ecu, config);

    let snapshot = harness.snapshot().await;
    assert_eq!(snapshot.get("coolant_temp"), Some(50.0));
    assert_eq!(snapshot.get("rpm"), Some(850.0));
    assert_eq!(snapshot.generation, 1);

    let (summary, ecu) = harness.finish().await;
    assert!(summary.stats.snapshots >= 1);
    assert_eq!(summary.stats.stale_frames, 0);
    assert_eq!(ecu.received()[..2], [Command::Init, Command::LiveData]);
}

#[tokio::test]
async fn test_periodic_dtc_read_then_resume() {
    let mut ecu = SimulatedEcu::new();
    ecu.set_dtcs(vec![DtcEntry {
        code: 0x21,
        starts: 3,
    }]);

    let config = ConsultConfig {
        registers: vec!["speed".into()],
        dtc_interval_ms: Some(200),
        ..Default::default()
    };
    let mut harness = start(ecu, config);

    harness.snapshot().await;
    let report = match harness
        .wait_for(|e| matches!(e, TelemetryEvent::Dtc(_)))
        .await
    {
        TelemetryEvent::Dtc(report) => report,
        _ => unreachable!(),
    };
    assert_eq!(
        report.codes,
        vec![DtcEntry {
            code: 0x21,
            starts: 3
        }]
    );

    // Streaming picks up again after the report
    harness.snapshot().await;

    let (_, ecu) = harness.finish().await;
    let received = ecu.received();
    let dtc_at = received
        .iter()
        .position(|c| *c == Command::ReadDtc)
        .unwrap();
    assert_eq!(received[dtc_at - 1], Command::Stop);
    assert_eq!(received[dtc_at + 1], Command::Stop);
    assert_eq!(received[dtc_at + 2], Command::LiveData);
}

#[tokio::test]
async fn test_selection_change_takes_effect() {
    let mut harness = start(
        SimulatedEcu::new(),
        ConsultConfig {
            registers: vec!["coolant_temp".into()],
            ..Default::default()
        },
    );
    harness.snapshot().await;

    let selection = RequestSelection::from_names(&["speed", "battery_voltage"]).unwrap();
    harness
        .commands
        .send(SessionCommand::SetSelection(selection))
        .unwrap();

    let event = harness
        .wait_for(|e| matches!(e, TelemetryEvent::Snapshot(s) if s.generation == 2))
        .await;
    let TelemetryEvent::Snapshot(snapshot) = event else {
        unreachable!()
    };
    assert!(snapshot.get("speed").is_some());
    assert!(snapshot.get("battery_voltage").is_some());
    assert_eq!(snapshot.get("coolant_temp"), None);

    harness.finish().await;
}

#[tokio::test]
async fn test_peer_hangup_is_transport_error() {
    let (host, ecu_side) = tokio::io::duplex(64);
    drop(ecu_side);

    let (_commands, commands_rx) = mpsc::unbounded_channel();
    let result = run_session(
        host,
        &ConsultConfig::default(),
        Vec::new(),
        commands_rx,
        CancellationToken::new(),
    )
    .await;

    match result {
        Err(e) => assert!(e.is_transport(), "unexpected error {e}"),
        Ok(_) => panic!("session should fail without a peer"),
    }
}

#[tokio::test]
async fn test_unknown_register_in_config() {
    let (host, _ecu_side) = tokio::io::duplex(64);
    let (_commands, commands_rx) = mpsc::unbounded_channel();
    let config = ConsultConfig {
        registers: vec!["boost_pressure".into()],
        ..Default::default()
    };

    let result = run_session(host, &config, Vec::new(), commands_rx, CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(ProtocolError::UnknownRegisterName(name)) if name == "boost_pressure"
    ));
}
