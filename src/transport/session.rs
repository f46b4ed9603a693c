//! WebSocket Session zum Voice-Service
//!
//! Verwaltet genau eine Duplex-Verbindung:
//! - Zustände `Closed → Connecting → Open → Closed`
//! - Automatisches `Setup` direkt nach dem Öffnen
//! - Keepalive-Pings im Write-Task
//! - Event-basierte Kommunikation mit dem Call Controller

use super::messages::{Modality, ServerUpdate, TransportMessage};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Standard-Timeout für den Verbindungsaufbau
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Standard-Intervall für Keepalive-Pings
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(25);

const CLOSED_BY_CLIENT: &str = "closed by client";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Unsupported URL scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),

    #[error("Session is already connecting or open")]
    AlreadyActive,

    #[error("No async runtime available")]
    NoRuntime,
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Not connected to voice service")]
    NotConnected,

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Connection writer is gone")]
    ChannelClosed,
}

// ============================================================================
// STATE & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Connecting,
    Open,
}

/// Events die von der TransportSession ausgelöst werden
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Verbindung offen, `Setup` ist bereits gesendet
    Connected,

    /// Eingehendes Update vom Voice-Service
    ServerUpdate(ServerUpdate),

    /// Verbindung getrennt (auch nach fehlgeschlagenem Verbindungsaufbau)
    Disconnected { reason: String },

    /// Fehler, kommt vor dem zugehörigen `Disconnected`
    Error { detail: String },
}

/// Duplex-Verbindung zum Voice-Service.
///
/// Alle Methoden kehren sofort zurück; das Ergebnis von `connect` kommt
/// über `TransportEvent::Connected` bzw. `TransportEvent::Disconnected`.
pub trait Transport: Send + Sync {
    fn connect(&self, url: &str) -> Result<(), ConnectError>;

    /// Fire-and-forget, schlägt mit `NotConnected` fehl solange nicht `Open`
    fn send(&self, message: TransportMessage) -> Result<(), SendError>;

    /// Idempotent
    fn close(&self);

    fn state(&self) -> TransportState;
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// `None` deaktiviert Pings
    pub keepalive: Option<Duration>,
    pub response_modalities: BTreeSet<Modality>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: Some(DEFAULT_KEEPALIVE),
            response_modalities: BTreeSet::from([Modality::Audio]),
        }
    }
}

// ============================================================================
// SESSION STATE
// ============================================================================

enum WriterCommand {
    Text(String),
    Close,
}

struct SessionInner {
    state: TransportState,
    /// Jeder `connect` erhöht die Epoche; Tasks alter Verbindungen verstummen
    epoch: u64,
    writer: Option<mpsc::UnboundedSender<WriterCommand>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct Shared {
    inner: RwLock<SessionInner>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl Shared {
    /// Sendet ein Event, solange die Verbindung `epoch` noch offen ist
    fn emit_current(&self, epoch: u64, event: TransportEvent) {
        let inner = self.inner.read();
        if inner.epoch == epoch && inner.state == TransportState::Open {
            let _ = self.event_tx.send(event);
        }
    }

    /// Beendet die Verbindung `epoch`, falls sie noch aktuell ist
    fn disconnect(&self, epoch: u64, reason: String, error: Option<String>) {
        let mut inner = self.inner.write();
        if inner.epoch != epoch || inner.state == TransportState::Closed {
            return;
        }

        inner.state = TransportState::Closed;
        inner.writer = None;
        inner.shutdown = None;

        tracing::info!("Voice session disconnected: {}", reason);
        if let Some(detail) = error {
            let _ = self.event_tx.send(TransportEvent::Error { detail });
        }
        let _ = self.event_tx.send(TransportEvent::Disconnected { reason });
    }
}

// ============================================================================
// TRANSPORT SESSION
// ============================================================================

/// WebSocket-Implementierung von [`Transport`]
pub struct TransportSession {
    config: TransportConfig,
    shared: Arc<Shared>,
}

impl TransportSession {
    /// Erstellt eine neue Session und den zugehörigen Event-Receiver
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Self {
            config,
            shared: Arc::new(Shared {
                inner: RwLock::new(SessionInner {
                    state: TransportState::Closed,
                    epoch: 0,
                    writer: None,
                    shutdown: None,
                }),
                event_tx,
            }),
        };

        (session, event_rx)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

impl Transport for TransportSession {
    fn connect(&self, url: &str) -> Result<(), ConnectError> {
        let parsed = Url::parse(url).map_err(|e| ConnectError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConnectError::UnsupportedScheme(parsed.scheme().to_string()));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConnectError::NoRuntime)?;

        let epoch = {
            let mut inner = self.shared.inner.write();
            if inner.state != TransportState::Closed {
                return Err(ConnectError::AlreadyActive);
            }
            inner.epoch += 1;
            inner.state = TransportState::Connecting;
            inner.epoch
        };

        // Token steht in der Query, daher nur den Host loggen
        tracing::info!(
            "Connecting to voice service: {}",
            parsed.host_str().unwrap_or("<unknown host>")
        );

        runtime.spawn(run_connection(
            Arc::clone(&self.shared),
            self.config.clone(),
            parsed,
            epoch,
        ));

        Ok(())
    }

    fn send(&self, message: TransportMessage) -> Result<(), SendError> {
        if self.state() != TransportState::Open {
            return Err(SendError::NotConnected);
        }

        let text = message.to_wire()?;

        let inner = self.shared.inner.read();
        if inner.state != TransportState::Open {
            return Err(SendError::NotConnected);
        }
        let writer = inner.writer.as_ref().ok_or(SendError::NotConnected)?;
        writer
            .send(WriterCommand::Text(text))
            .map_err(|_| SendError::ChannelClosed)
    }

    fn close(&self) {
        let mut inner = self.shared.inner.write();
        if inner.state == TransportState::Closed {
            return;
        }

        inner.state = TransportState::Closed;

        // Close-Frame hinter bereits eingereihten Nachrichten
        if let Some(writer) = inner.writer.take() {
            let _ = writer.send(WriterCommand::Close);
        }
        if let Some(shutdown) = inner.shutdown.take() {
            let _ = shutdown.send(());
        }

        tracing::info!("Voice session closed by client");
        let _ = self.shared.event_tx.send(TransportEvent::Disconnected {
            reason: CLOSED_BY_CLIENT.to_string(),
        });
    }

    fn state(&self) -> TransportState {
        self.shared.inner.read().state
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

async fn run_connection(shared: Arc<Shared>, config: TransportConfig, url: Url, epoch: u64) {
    let ws_stream = match tokio::time::timeout(config.connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            tracing::warn!("WebSocket connection failed: {}", e);
            shared.disconnect(epoch, "connection failed".to_string(), Some(e.to_string()));
            return;
        }
        Err(_) => {
            tracing::warn!("WebSocket connection timed out after {:?}", config.connect_timeout);
            shared.disconnect(
                epoch,
                "connection timed out".to_string(),
                Some(format!("no connection after {:?}", config.connect_timeout)),
            );
            return;
        }
    };

    let setup = match TransportMessage::setup(config.response_modalities.iter().copied()).to_wire() {
        Ok(text) => text,
        Err(e) => {
            shared.disconnect(epoch, "setup failed".to_string(), Some(e.to_string()));
            return;
        }
    };

    let (write, read) = ws_stream.split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    {
        let mut inner = shared.inner.write();
        if inner.epoch != epoch || inner.state != TransportState::Connecting {
            // close() während des Verbindungsaufbaus
            tracing::debug!("Discarding connection of closed session");
            return;
        }

        // Setup vor jedem anderen Frame einreihen, erst dann Open
        let _ = writer_tx.send(WriterCommand::Text(setup));
        inner.writer = Some(writer_tx);
        inner.shutdown = Some(shutdown_tx);
        inner.state = TransportState::Open;

        tracing::info!("Voice session open");
        let _ = shared.event_tx.send(TransportEvent::Connected);
    }

    tokio::spawn(write_loop(Arc::clone(&shared), write, writer_rx, config.keepalive, epoch));

    let (reason, error) = read_loop(&shared, read, shutdown_rx, epoch).await;
    shared.disconnect(epoch, reason, error);
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: SplitSink<WsStream, Message>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    keepalive: Option<Duration>,
    epoch: u64,
) {
    let mut ping = keepalive.map(|period| interval_at(Instant::now() + period, period));

    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = next_tick(&mut ping) => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    tracing::error!("Failed to send keepalive ping: {}", e);
                    shared.disconnect(epoch, "keepalive failed".to_string(), Some(e.to_string()));
                    break;
                }
                continue;
            }
        };

        match command {
            Some(WriterCommand::Text(text)) => {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    shared.disconnect(epoch, "write failed".to_string(), Some(e.to_string()));
                    break;
                }
            }
            Some(WriterCommand::Close) => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            None => break,
        }
    }
}

async fn next_tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn read_loop(
    shared: &Shared,
    mut stream: SplitStream<WsStream>,
    mut shutdown: oneshot::Receiver<()>,
    epoch: u64,
) -> (String, Option<String>) {
    loop {
        let next = tokio::select! {
            _ = &mut shutdown => return (CLOSED_BY_CLIENT.to_string(), None),
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => match ServerUpdate::parse(&text) {
                Ok(update) => shared.emit_current(epoch, TransportEvent::ServerUpdate(update)),
                Err(e) => tracing::warn!("Dropping inbound frame: {}", e),
            },
            Some(Ok(Message::Close(frame))) => {
                let reason = match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("closed by server: {}", frame.reason)
                    }
                    _ => "closed by server".to_string(),
                };
                return (reason, None);
            }
            Some(Ok(Message::Binary(data))) => {
                tracing::debug!("Ignoring binary frame ({} bytes)", data.len());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {}", e);
                return ("connection error".to_string(), Some(e.to_string()));
            }
            None => return ("connection lost".to_string(), None),
        }
    }
}
