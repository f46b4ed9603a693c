//! Call Controller
//!
//! Verbindet Capture, Playback und Transport zu einem Anruf. Der gesamte
//! Zustand lebt in einem einzigen Actor-Task; alle Zustandsübergänge laufen
//! seriell über dessen `select!`-Schleife. Ausgehendes Audio geht durch eine
//! einzige geordnete Queue, die von genau einem Sender-Task abgearbeitet wird.

use super::session::{CallSession, CallSnapshot, CallState, CallSummary, DisconnectOutcome};
use crate::audio::{
    AudioFrame, CaptureBackend, CaptureEngine, CaptureError, CaptureEvent, PlaybackBackend,
    PlaybackEngine, PlaybackEvent, DEFAULT_MAX_QUEUED,
};
use crate::transport::{
    ConnectError, SendError, Transport, TransportEvent, TransportMessage, TransportState,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use uuid::Uuid;

/// Wie lange `hang_up` höchstens auf das Leeren der Sende-Queue wartet
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Call has already ended")]
    CallEnded,

    #[error("Not connected to voice service")]
    NotConnected,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("No async runtime available")]
    NoRuntime,

    #[error("Connection failed: {0}")]
    Connect(#[from] ConnectError),

    #[error("Audio error: {0}")]
    Capture(#[from] CaptureError),
}

/// Für den Benutzer sichtbare Fehler
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFailure {
    #[error("microphone unavailable")]
    MicrophoneUnavailable,

    #[error("speaker unavailable")]
    SpeakerUnavailable,

    #[error("connection lost, reconnect budget exhausted")]
    ConnectionLost,
}

impl CallFailure {
    /// Meldung für die Oberfläche (ohne Protokoll-Details)
    pub fn user_message(&self) -> &'static str {
        match self {
            CallFailure::MicrophoneUnavailable => "녹음을 시작할 수 없습니다.",
            CallFailure::SpeakerUnavailable => "AI 음성을 재생할 수 없습니다.",
            CallFailure::ConnectionLost => "AI와의 대화 연결에 실패했습니다. 다시 시도해주세요.",
        }
    }
}

// ============================================================================
// EVENTS & CONFIG
// ============================================================================

/// Events die vom CallController ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { state: CallState },
    ConnectionChanged { connected: bool, reason: Option<String> },
    /// Eingehende Nachricht; `audio` ist die Dauer des empfangenen Frames
    Message { text: Option<String>, audio: Option<Duration> },
    Elapsed { seconds: u64 },
    Failure(CallFailure),
    /// Letztes Event eines Anrufs
    Ended(CallSummary),
}

/// Reconnect- und Timing-Regeln eines Anrufs
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub tick_interval: Duration,
    pub max_playback_queue: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            tick_interval: Duration::from_secs(1),
            max_playback_queue: DEFAULT_MAX_QUEUED,
        }
    }
}

/// Die Ressourcen, die ein Anruf exklusiv besitzt
pub struct CallDeps {
    pub transport: Arc<dyn Transport>,
    pub transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    pub capture: Arc<dyn CaptureBackend>,
    pub playback: Arc<dyn PlaybackBackend>,
}

// ============================================================================
// INTERNAL MESSAGES
// ============================================================================

enum Command {
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SetSpeaker {
        on: bool,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    StartRecording {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    StopRecording {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    HangUp {
        reply: oneshot::Sender<Option<CallSummary>>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
}

/// Einträge der geordneten Sende-Queue
enum Outbound {
    Frame(AudioFrame),
    EndOfStream,
    /// Bestätigt, dass alles davor an den Transport übergeben wurde
    Flush(oneshot::Sender<()>),
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// Handle auf einen laufenden Anruf (günstig klonbar)
#[derive(Clone)]
pub struct CallController {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
}

impl CallController {
    /// Startet einen Anruf: `Idle → Connecting`, verbindet den Transport und
    /// startet den Ticker für die Gesprächsdauer.
    pub fn start(
        url: impl Into<String>,
        policy: CallPolicy,
        deps: CallDeps,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>), CallError> {
        let url = url.into();
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CallError::NoRuntime)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();

        let mut session = CallSession::new();
        session.begin_connecting(std::time::Instant::now());
        let id = session.id();

        deps.transport.connect(&url)?;

        tracing::info!("Call {} started", id);
        let _ = event_tx.send(CallEvent::StateChanged {
            state: CallState::Connecting,
        });

        runtime.spawn(send_loop(
            Arc::clone(&deps.transport),
            outbound_rx,
            feedback_tx,
        ));

        let actor = CallActor {
            url,
            session,
            transport: deps.transport,
            capture: CaptureEngine::new(deps.capture, capture_tx),
            capture_rx,
            playback: PlaybackEngine::new(deps.playback, policy.max_playback_queue, playback_tx),
            outbound: outbound_tx,
            events: event_tx,
            retry_at: None,
            recording_segment: None,
            policy,
        };

        runtime.spawn(actor.run(
            command_rx,
            deps.transport_events,
            playback_rx,
            feedback_rx,
        ));

        Ok((
            Self {
                id,
                commands: command_tx,
            },
            event_rx,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// `false` sobald der Anruf beendet ist
    pub fn is_active(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Mikrofon stumm schalten oder wieder freigeben
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await?
    }

    /// Lautsprecher an/aus; aus verwirft empfangenes Audio
    pub async fn set_speaker(&self, on: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetSpeaker { on, reply }).await?
    }

    pub async fn start_recording(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartRecording { reply }).await?
    }

    pub async fn stop_recording(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StopRecording { reply }).await?
    }

    /// Legt auf. Gibt beim ersten Aufruf die Zusammenfassung zurück, danach `None`.
    pub async fn hang_up(&self) -> Option<CallSummary> {
        self.request(|reply| Command::HangUp { reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| CallError::CallEnded)?;
        reply_rx.await.map_err(|_| CallError::CallEnded)
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

// ============================================================================
// SENDER TASK
// ============================================================================

/// Einziger Konsument der Sende-Queue: überträgt strikt in Reihenfolge
async fn send_loop(
    transport: Arc<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
    feedback: mpsc::UnboundedSender<SendError>,
) {
    while let Some(item) = queue.recv().await {
        let message = match item {
            Outbound::Frame(frame) => TransportMessage::audio(&frame),
            Outbound::EndOfStream => TransportMessage::end_of_stream(),
            Outbound::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        if let Err(e) = transport.send(message) {
            let _ = feedback.send(e);
        }
    }
    tracing::debug!("Send queue closed");
}

// ============================================================================
// CALL ACTOR
// ============================================================================

struct CallActor {
    url: String,
    policy: CallPolicy,
    session: CallSession,
    transport: Arc<dyn Transport>,
    capture: CaptureEngine,
    capture_rx: mpsc::UnboundedReceiver<CaptureEvent>,
    playback: PlaybackEngine,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<CallEvent>,
    retry_at: Option<Instant>,
    /// Segment, dessen Frames gerade gesendet werden
    recording_segment: Option<u64>,
}

impl CallActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        mut playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
        mut feedback: mpsc::UnboundedReceiver<SendError>,
    ) {
        let mut ticker = tokio::time::interval(self.policy.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.session.is_ended() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::info!("All call handles dropped, hanging up");
                        self.hang_up().await;
                    }
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event).await,
                Some(event) = self.capture_rx.recv() => self.handle_capture_event(event).await,
                Some(event) = playback_events.recv() => self.handle_playback_event(event),
                Some(error) = feedback.recv() => self.handle_send_error(error),
                _ = ticker.tick() => self.tick(),
                _ = retry_deadline(self.retry_at) => self.retry().await,
            }
        }

        tracing::info!("Call {} finished", self.session.id());
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            Command::SetSpeaker { on, reply } => {
                let _ = reply.send(self.set_speaker(on));
            }
            Command::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            Command::StopRecording { reply } => {
                let _ = reply.send(self.stop_recording().await);
            }
            Command::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
        }
    }

    async fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        if self.session.is_ended() {
            return Err(CallError::CallEnded);
        }
        if !self.session.set_muted(muted) {
            return Ok(());
        }

        tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });

        if muted {
            self.stop_capture().await;
        } else if self.session.state() == CallState::Connected {
            if let Err(e) = self.start_capture() {
                self.session.set_muted(true);
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn set_speaker(&mut self, on: bool) -> Result<(), CallError> {
        if self.session.is_ended() {
            return Err(CallError::CallEnded);
        }
        if self.session.set_speaker(on) && !on {
            self.playback.stop();
        }
        Ok(())
    }

    /// Öffnet das Mikrofon; hebt eine Stummschaltung auf
    fn start_recording(&mut self) -> Result<(), CallError> {
        match self.session.state() {
            CallState::Ended => return Err(CallError::CallEnded),
            CallState::Connected => {}
            _ => return Err(CallError::NotConnected),
        }
        if self.capture.is_running() {
            return Err(CallError::AlreadyRecording);
        }

        self.start_capture()?;
        self.session.set_muted(false);
        Ok(())
    }

    /// Schließt das Mikrofon; entspricht einer Stummschaltung
    async fn stop_recording(&mut self) -> Result<(), CallError> {
        if self.session.is_ended() {
            return Err(CallError::CallEnded);
        }
        self.session.set_muted(true);
        self.stop_capture().await;
        Ok(())
    }

    async fn hang_up(&mut self) -> Option<CallSummary> {
        if !self.session.hang_up() {
            return None;
        }

        tracing::info!("Call {} hung up", self.session.id());
        self.teardown().await;
        self.finish()
    }

    // ------------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if !self.session.on_connected() {
                    return;
                }
                self.retry_at = None;
                self.emit(CallEvent::StateChanged {
                    state: CallState::Connected,
                });
                self.emit(CallEvent::ConnectionChanged {
                    connected: true,
                    reason: None,
                });

                if !self.session.mic_muted() {
                    if let Err(e) = self.start_capture() {
                        tracing::error!("Failed to start capture: {}", e);
                    }
                }
            }
            TransportEvent::ServerUpdate(update) => {
                if self.session.is_ended() {
                    return;
                }

                if let Some(text) = &update.text {
                    tracing::debug!("AI response: {}", text);
                    self.session.push_transcript(text.clone());
                }

                let audio = match update.audio.map(|chunk| chunk.decode()) {
                    Some(Ok(frame)) => {
                        let duration = frame.duration();
                        if self.session.speaker_on() {
                            self.playback.enqueue(frame);
                        }
                        Some(duration)
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Dropping undecodable audio chunk: {}", e);
                        None
                    }
                    None => None,
                };

                if update.text.is_some() || audio.is_some() {
                    self.emit(CallEvent::Message {
                        text: update.text,
                        audio,
                    });
                }
            }
            TransportEvent::Disconnected { reason } => self.handle_disconnect(reason).await,
            TransportEvent::Error { detail } => {
                tracing::warn!("Transport error: {}", detail);
            }
        }
    }

    async fn handle_disconnect(&mut self, reason: String) {
        let previous = self.session.state();
        let outcome = self.session.on_disconnected(self.policy.max_reconnect_attempts);
        if outcome == DisconnectOutcome::Ignored {
            return;
        }

        // Frames während der Trennung könnten nicht gesendet werden
        if self.capture.is_running() {
            self.recording_segment = None;
            if let Err(e) = self.capture.stop_async().await {
                tracing::warn!("Failed to stop capture: {}", e);
            }
        }

        self.emit(CallEvent::ConnectionChanged {
            connected: false,
            reason: Some(reason.clone()),
        });

        match outcome {
            DisconnectOutcome::Retry { attempt } => {
                tracing::warn!(
                    "Connection lost ({}), reconnect attempt {}/{} in {:?}",
                    reason,
                    attempt,
                    self.policy.max_reconnect_attempts,
                    self.policy.reconnect_delay
                );
                self.retry_at = Some(Instant::now() + self.policy.reconnect_delay);
                if previous != CallState::Reconnecting {
                    self.emit(CallEvent::StateChanged {
                        state: CallState::Reconnecting,
                    });
                }
            }
            DisconnectOutcome::Exhausted => {
                tracing::error!(
                    "Reconnect budget of {} attempts exceeded, ending call",
                    self.policy.max_reconnect_attempts
                );
                self.emit(CallEvent::Failure(CallFailure::ConnectionLost));
                self.teardown().await;
                self.finish();
            }
            DisconnectOutcome::Ignored => {}
        }
    }

    async fn retry(&mut self) {
        self.retry_at = None;
        if self.session.state() != CallState::Reconnecting {
            return;
        }

        tracing::info!("Reconnecting to voice service");
        if let Err(e) = self.transport.connect(&self.url) {
            // Gleicher Pfad wie eine fehlgeschlagene Verbindung
            tracing::warn!("Reconnect failed immediately: {}", e);
            self.handle_disconnect(e.to_string()).await;
        }
    }

    fn handle_send_error(&mut self, error: SendError) {
        match error {
            SendError::NotConnected => tracing::debug!("Dropping outbound message, not connected"),
            other => tracing::warn!("Failed to send message: {}", other),
        }
    }

    // ------------------------------------------------------------------------
    // Audio
    // ------------------------------------------------------------------------

    async fn handle_capture_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame { segment, frame } => {
                if self.recording_segment != Some(segment) {
                    tracing::debug!("Dropping frame of stale segment {}", segment);
                    return;
                }
                let _ = self.outbound.send(Outbound::Frame(frame));
            }
            CaptureEvent::Failed { segment, detail } => {
                if self.recording_segment != Some(segment) {
                    return;
                }
                tracing::error!("Microphone failed: {}", detail);
                self.stop_capture().await;
                self.emit(CallEvent::Failure(CallFailure::MicrophoneUnavailable));
            }
        }
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::DeviceFailed { detail } => {
                tracing::error!("Speaker failed: {}", detail);
                self.emit(CallEvent::Failure(CallFailure::SpeakerUnavailable));
            }
        }
    }

    fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.capture.is_running() {
            return Ok(());
        }

        if let Err(e) = self.capture.start() {
            self.emit(CallEvent::Failure(CallFailure::MicrophoneUnavailable));
            return Err(e);
        }
        self.recording_segment = Some(self.capture.segment());
        Ok(())
    }

    /// Stoppt die Aufnahme; beendet ein aktives Segment mit `end_of_stream`.
    ///
    /// Frames, die das Segment vor dem Stopp gelesen hat und die noch im
    /// Capture-Kanal liegen, werden vorher in die Sende-Queue übernommen.
    async fn stop_capture(&mut self) {
        let segment = self.recording_segment.take();
        if let Err(e) = self.capture.stop_async().await {
            tracing::warn!("Failed to stop capture: {}", e);
        }

        let Some(segment) = segment else {
            return;
        };

        // Der Lese-Thread ist beendet, der Kanal enthält den Rest des Segments
        let mut tail = 0;
        while let Ok(event) = self.capture_rx.try_recv() {
            if let CaptureEvent::Frame { segment: s, frame } = event {
                if s == segment {
                    let _ = self.outbound.send(Outbound::Frame(frame));
                    tail += 1;
                }
            }
        }
        if tail > 0 {
            tracing::debug!("Forwarded {} pending frames of segment {}", tail, segment);
        }

        if self.transport.state() == TransportState::Open {
            let _ = self.outbound.send(Outbound::EndOfStream);
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn tick(&mut self) {
        if let Some(seconds) = self.session.tick(std::time::Instant::now()) {
            self.emit(CallEvent::Elapsed { seconds });
        }
    }

    /// Gibt alle Ressourcen des Anrufs frei
    async fn teardown(&mut self) {
        self.retry_at = None;
        self.stop_capture().await;

        // Alles Eingereihte (inkl. end_of_stream) vor dem Schließen übergeben
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(ack_tx)).is_ok()
            && tokio::time::timeout(FLUSH_TIMEOUT, ack_rx).await.is_err()
        {
            tracing::warn!("Send queue did not drain before hang-up");
        }

        self.playback.shutdown();
        self.transport.close();
    }

    fn finish(&mut self) -> Option<CallSummary> {
        let summary = self.session.summary(std::time::Instant::now())?;
        tracing::info!(
            "Call {} ended after {}s ({:?})",
            summary.call_id,
            summary.duration_secs,
            summary.end_reason
        );

        self.emit(CallEvent::StateChanged {
            state: CallState::Ended,
        });
        self.emit(CallEvent::Ended(summary.clone()));
        Some(summary)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

async fn retry_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
