//! Async session driver
//!
//! Runs an [`Engine`] over any async byte stream: a `tokio-serial` port in
//! production, an in-memory duplex pipe in tests and demo mode. One loop,
//! one branch per event: bytes received, DTC timer, control command,
//! cancellation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{Engine, EngineStats};
use super::request::RequestSelection;
use super::serial::open_async;
use super::stream::Outbox;
use super::ProtocolError;
use crate::config::ConsultConfig;
use crate::telemetry::TelemetrySink;

/// Requests from the session owner
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Stop and restart the stream
    Stop,
    /// Read trouble codes now
    ReadDtc,
    /// Switch to another register selection
    SetSelection(RequestSelection),
}

/// What a session hands back when it ends cleanly
#[derive(Debug)]
pub struct SessionSummary<S> {
    pub sink: S,
    pub stats: EngineStats,
}

/// Drive a Consult session over `io` until `cancel` fires
///
/// Transport failures (read or write errors, end of stream) end the session
/// with [`ProtocolError::TransportError`]; they are not retried.
pub async fn run_session<IO, S>(
    io: IO,
    config: &ConsultConfig,
    sink: S,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
) -> Result<SessionSummary<S>, ProtocolError>
where
    IO: AsyncRead + AsyncWrite,
    S: TelemetrySink,
{
    let selection = config.selection()?;
    let mut engine = Engine::new(selection, Outbox::new(), sink, config.engine_config());
    let (mut reader, mut writer) = tokio::io::split(io);

    let mut dtc_timer = config.dtc_interval().map(|period| {
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    });

    let mut buf = vec![0u8; config.read_chunk_size.max(1)];
    let mut commands_open = true;

    engine.on_open()?;
    flush(&mut engine, &mut writer).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Session cancelled");
                engine.on_close();
                break;
            }
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        engine.on_close();
                        return Err(ProtocolError::TransportError("line closed by peer".into()));
                    }
                    Ok(n) => engine.on_data(&buf[..n])?,
                    Err(e) => {
                        warn!("Read failed: {}", e);
                        engine.on_close();
                        return Err(ProtocolError::TransportError(e.to_string()));
                    }
                }
            }
            _ = next_tick(&mut dtc_timer) => {
                debug!("DTC timer fired");
                engine.request_dtc()?;
            }
            command = commands.recv(), if commands_open => {
                match command {
                    Some(SessionCommand::Stop) => engine.request_stop()?,
                    Some(SessionCommand::ReadDtc) => engine.request_dtc()?,
                    Some(SessionCommand::SetSelection(selection)) => engine.set_selection(selection)?,
                    None => commands_open = false,
                }
            }
        }
        flush(&mut engine, &mut writer).await?;
    }

    let stats = engine.stats();
    let (_, sink) = engine.into_parts();
    Ok(SessionSummary { sink, stats })
}

/// Open the configured serial port and run a session on it
pub async fn run_serial_session<S: TelemetrySink>(
    config: &ConsultConfig,
    sink: S,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    cancel: CancellationToken,
) -> Result<SessionSummary<S>, ProtocolError> {
    let port = open_async(&config.port_name, Some(config.baud_rate))?;
    run_session(port, config, sink, commands, cancel).await
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn flush<IO, S>(
    engine: &mut Engine<Outbox, S>,
    writer: &mut WriteHalf<IO>,
) -> Result<(), ProtocolError>
where
    IO: AsyncWrite,
    S: TelemetrySink,
{
    let writes: Vec<Vec<u8>> = engine.transport_mut().drain().collect();
    for bytes in writes {
        let result = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Write failed: {}", e);
            engine.on_close();
            return Err(ProtocolError::TransportError(e.to_string()));
        }
    }
    Ok(())
}
