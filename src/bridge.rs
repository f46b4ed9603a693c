//! UI-Bridge
//!
//! Die Befehls- und Event-Schnittstelle zur (externen) Oberfläche:
//! `connect`, `start_recording`, `stop_recording`, `disconnect` sowie
//! `onMessage`, `onConnectionStateChange` und `onError` als JSON-Events.

use crate::audio::{CaptureBackend, PlaybackBackend};
use crate::call_engine::{
    CallController, CallDeps, CallError, CallEvent, CallSnapshot, CallState, CallSummary,
};
use crate::config::{CallConfig, ConfigError};
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportSession};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No active call")]
    NoActiveCall,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Call(#[from] CallError),
}

// ============================================================================
// UI EVENTS
// ============================================================================

/// Beschreibung einer empfangenen Audio-Antwort.
///
/// Die PCM-Daten selbst werden intern abgespielt und nicht an die
/// Oberfläche weitergegeben.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInfo {
    pub duration_ms: u64,
}

/// Events an die Oberfläche (als JSON serialisierbar)
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UiEvent {
    OnMessage {
        text: Option<String>,
        audio: Option<AudioInfo>,
    },
    OnConnectionStateChange {
        connected: bool,
        reason: Option<String>,
    },
    /// Nur Klartext-Meldungen, keine Protokoll-Details
    OnError { error: String },
    OnCallStateChange { state: CallState },
    OnElapsed { seconds: u64 },
    OnCallEnded { summary: CallSummary },
}

impl From<CallEvent> for UiEvent {
    fn from(event: CallEvent) -> Self {
        match event {
            CallEvent::StateChanged { state } => UiEvent::OnCallStateChange { state },
            CallEvent::ConnectionChanged { connected, reason } => {
                UiEvent::OnConnectionStateChange { connected, reason }
            }
            CallEvent::Message { text, audio } => UiEvent::OnMessage {
                text,
                audio: audio.map(|duration| AudioInfo {
                    duration_ms: duration.as_millis() as u64,
                }),
            },
            CallEvent::Elapsed { seconds } => UiEvent::OnElapsed { seconds },
            CallEvent::Failure(failure) => UiEvent::OnError {
                error: failure.user_message().to_string(),
            },
            CallEvent::Ended(summary) => UiEvent::OnCallEnded { summary },
        }
    }
}

// ============================================================================
// AI CALL MODULE
// ============================================================================

/// Erstellt pro Anruf einen frischen Transport
pub type TransportFactory = Arc<
    dyn Fn(TransportConfig) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>)
        + Send
        + Sync,
>;

/// Hält höchstens einen aktiven Anruf und leitet dessen Events weiter
pub struct AiCallModule {
    config: CallConfig,
    capture: Arc<dyn CaptureBackend>,
    playback: Arc<dyn PlaybackBackend>,
    transport_factory: TransportFactory,
    active: Arc<Mutex<Option<CallController>>>,
    event_tx: broadcast::Sender<UiEvent>,
}

impl AiCallModule {
    /// Erstellt ein neues Modul mit WebSocket-Transport
    pub fn new(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        playback: Arc<dyn PlaybackBackend>,
    ) -> Self {
        let factory: TransportFactory = Arc::new(|transport_config| {
            let (session, events) = TransportSession::new(transport_config);
            (Arc::new(session) as Arc<dyn Transport>, events)
        });
        Self::with_transport_factory(config, capture, playback, factory)
    }

    pub fn with_transport_factory(
        config: CallConfig,
        capture: Arc<dyn CaptureBackend>,
        playback: Arc<dyn PlaybackBackend>,
        transport_factory: TransportFactory,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            config,
            capture,
            playback,
            transport_factory,
            active: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Verbindet mit der konfigurierten URL
    pub async fn connect_configured(&self) -> Result<Uuid, BridgeError> {
        let url = self.config.call_url()?;
        self.connect(&url).await
    }

    /// Startet einen Anruf zu `url`
    pub async fn connect(&self, url: &str) -> Result<Uuid, BridgeError> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|call| call.is_active()) {
            return Err(BridgeError::AlreadyInCall);
        }

        let (transport, transport_events) = (self.transport_factory)(self.config.transport_config());
        let (controller, events) = CallController::start(
            url,
            self.config.policy(),
            CallDeps {
                transport,
                transport_events,
                capture: Arc::clone(&self.capture),
                playback: Arc::clone(&self.playback),
            },
        )?;

        let id = controller.id();
        tokio::spawn(forward_events(
            id,
            events,
            self.event_tx.clone(),
            Arc::clone(&self.active),
        ));

        *active = Some(controller);
        Ok(id)
    }

    pub async fn start_recording(&self) -> Result<(), BridgeError> {
        let call = self.current().ok_or(BridgeError::NoActiveCall)?;
        Ok(call.start_recording().await?)
    }

    /// Idempotent; ohne Anruf ein No-op
    pub async fn stop_recording(&self) -> Result<(), BridgeError> {
        match self.current() {
            Some(call) => match call.stop_recording().await {
                Ok(()) | Err(CallError::CallEnded) => Ok(()),
                Err(e) => Err(e.into()),
            },
            None => Ok(()),
        }
    }

    /// Legt auf; ohne Anruf ein No-op
    pub async fn disconnect(&self) -> Result<Option<CallSummary>, BridgeError> {
        let call = self.active.lock().take();
        match call {
            Some(call) => Ok(call.hang_up().await),
            None => Ok(None),
        }
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), BridgeError> {
        let call = self.current().ok_or(BridgeError::NoActiveCall)?;
        Ok(call.set_muted(muted).await?)
    }

    pub async fn set_speaker(&self, on: bool) -> Result<(), BridgeError> {
        let call = self.current().ok_or(BridgeError::NoActiveCall)?;
        Ok(call.set_speaker(on).await?)
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        let call = self.current()?;
        call.snapshot().await.ok()
    }

    /// Aktiver Anruf, Lock wird sofort wieder freigegeben
    fn current(&self) -> Option<CallController> {
        self.active.lock().clone()
    }
}

impl std::fmt::Debug for AiCallModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiCallModule")
            .field("config", &self.config)
            .field("active", &*self.active.lock())
            .finish()
    }
}

/// Leitet die Events eines Anrufs an die Oberfläche weiter
async fn forward_events(
    call_id: Uuid,
    mut events: mpsc::UnboundedReceiver<CallEvent>,
    ui: broadcast::Sender<UiEvent>,
    active: Arc<Mutex<Option<CallController>>>,
) {
    while let Some(event) = events.recv().await {
        let ended = matches!(event, CallEvent::Ended(_));
        let _ = ui.send(UiEvent::from(event));

        if ended {
            let mut active = active.lock();
            if active.as_ref().is_some_and(|call| call.id() == call_id) {
                *active = None;
            }
            break;
        }
    }
    tracing::debug!("Event forwarding for call {} finished", call_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::{CallFailure, EndReason};
    use chrono::Utc;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_ui_event_json_shape() {
        let event = UiEvent::from(CallEvent::Message {
            text: Some("hi".to_string()),
            audio: Some(Duration::from_millis(100)),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "onMessage", "text": "hi", "audio": {"durationMs": 100}})
        );

        let event = UiEvent::from(CallEvent::ConnectionChanged {
            connected: false,
            reason: Some("connection lost".to_string()),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "onConnectionStateChange", "connected": false, "reason": "connection lost"})
        );
    }

    #[test]
    fn test_text_only_message_has_null_audio() {
        let event = UiEvent::from(CallEvent::Message {
            text: Some("오늘 어땠어요?".to_string()),
            audio: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "onMessage");
        assert!(value["audio"].is_null());
    }

    #[test]
    fn test_failures_map_to_plain_messages() {
        let event = UiEvent::from(CallEvent::Failure(CallFailure::ConnectionLost));
        match event {
            UiEvent::OnError { error } => {
                assert_eq!(error, CallFailure::ConnectionLost.user_message());
                assert!(!error.contains("reconnect"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_ended_event_carries_summary() {
        let summary = CallSummary {
            call_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_secs: 42,
            reconnects: 1,
            end_reason: EndReason::HungUp,
            transcript: Vec::new(),
        };

        let value = serde_json::to_value(UiEvent::from(CallEvent::Ended(summary))).unwrap();
        assert_eq!(value["event"], "onCallEnded");
        assert_eq!(value["summary"]["duration_secs"], 42);
        assert_eq!(value["summary"]["end_reason"], "hung_up");
    }
}
