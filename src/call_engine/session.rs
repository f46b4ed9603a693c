//! Zustand eines einzelnen Anrufs
//!
//! `CallSession` enthält nur Daten und Zustandsübergänge, keine I/O.
//! Der Call Controller besitzt genau eine Instanz pro Anruf.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

// ============================================================================
// CALL STATE
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Noch nicht gestartet
    Idle,
    /// Erster Verbindungsaufbau läuft
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Verbindung verloren, neuer Versuch geplant
    Reconnecting,
    /// Anruf beendet (terminal)
    Ended,
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    HungUp,
    ReconnectBudgetExceeded,
}

/// Ergebnis eines `Disconnected` Events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Neuer Verbindungsversuch Nummer `attempt`
    Retry { attempt: u32 },
    /// Budget aufgebraucht, Anruf ist jetzt `Ended`
    Exhausted,
    /// Nichts zu tun (beendet oder nie gestartet)
    Ignored,
}

/// Ein Eintrag im Gesprächsprotokoll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// Zusammenfassung, die beim Beenden eines Anrufs ausgegeben wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
    pub reconnects: u32,
    pub end_reason: EndReason,
    pub transcript: Vec<TranscriptEntry>,
}

/// Momentaufnahme für UI-Polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSnapshot {
    pub call_id: Uuid,
    pub state: CallState,
    pub mic_muted: bool,
    pub speaker_on: bool,
    pub elapsed_seconds: u64,
    pub reconnect_attempts: u32,
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug)]
pub struct CallSession {
    id: Uuid,
    state: CallState,
    mic_muted: bool,
    speaker_on: bool,
    started_at: DateTime<Utc>,
    started: Option<Instant>,
    elapsed_seconds: u64,
    reconnect_attempts: u32,
    total_reconnects: u32,
    user_terminated: bool,
    end_reason: Option<EndReason>,
    transcript: Vec<TranscriptEntry>,
}

impl CallSession {
    /// Erstellt eine neue Session im Zustand `Idle`
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: CallState::Idle,
            mic_muted: false,
            speaker_on: true,
            started_at: Utc::now(),
            started: None,
            elapsed_seconds: 0,
            reconnect_attempts: 0,
            total_reconnects: 0,
            user_terminated: false,
            end_reason: None,
            transcript: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_ended(&self) -> bool {
        self.state == CallState::Ended
    }

    pub fn mic_muted(&self) -> bool {
        self.mic_muted
    }

    pub fn speaker_on(&self) -> bool {
        self.speaker_on
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    /// `Idle → Connecting`, startet die Gesprächsdauer
    pub fn begin_connecting(&mut self, now: Instant) -> bool {
        if self.state != CallState::Idle {
            return false;
        }
        self.state = CallState::Connecting;
        self.started_at = Utc::now();
        self.started = Some(now);
        true
    }

    /// `Connecting | Reconnecting → Connected`, setzt den Zähler zurück
    pub fn on_connected(&mut self) -> bool {
        match self.state {
            CallState::Connecting => {}
            CallState::Reconnecting => self.total_reconnects += 1,
            _ => return false,
        }
        self.state = CallState::Connected;
        self.reconnect_attempts = 0;
        true
    }

    /// Verbindung verloren, ohne dass der Benutzer aufgelegt hat
    pub fn on_disconnected(&mut self, max_attempts: u32) -> DisconnectOutcome {
        if self.user_terminated || matches!(self.state, CallState::Idle | CallState::Ended) {
            return DisconnectOutcome::Ignored;
        }

        self.reconnect_attempts += 1;
        if self.reconnect_attempts > max_attempts {
            self.state = CallState::Ended;
            self.end_reason = Some(EndReason::ReconnectBudgetExceeded);
            return DisconnectOutcome::Exhausted;
        }

        self.state = CallState::Reconnecting;
        DisconnectOutcome::Retry {
            attempt: self.reconnect_attempts,
        }
    }

    /// Vom Benutzer beendet; `false` wenn bereits `Ended`
    pub fn hang_up(&mut self) -> bool {
        if self.state == CallState::Ended {
            return false;
        }
        self.user_terminated = true;
        self.state = CallState::Ended;
        self.end_reason = Some(EndReason::HungUp);
        true
    }

    /// Gibt `true` zurück wenn sich der Wert geändert hat
    pub fn set_muted(&mut self, muted: bool) -> bool {
        let changed = self.mic_muted != muted;
        self.mic_muted = muted;
        changed
    }

    /// Gibt `true` zurück wenn sich der Wert geändert hat
    pub fn set_speaker(&mut self, on: bool) -> bool {
        let changed = self.speaker_on != on;
        self.speaker_on = on;
        changed
    }

    /// Aktualisiert die Gesprächsdauer; `Some` nur bei einer neuen vollen Sekunde
    pub fn tick(&mut self, now: Instant) -> Option<u64> {
        let started = self.started?;
        if self.is_ended() {
            return None;
        }

        let seconds = now.saturating_duration_since(started).as_secs();
        if seconds == self.elapsed_seconds {
            return None;
        }
        self.elapsed_seconds = seconds;
        Some(seconds)
    }

    pub fn push_transcript(&mut self, text: String) {
        self.transcript.push(TranscriptEntry {
            at: Utc::now(),
            text,
        });
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            state: self.state,
            mic_muted: self.mic_muted,
            speaker_on: self.speaker_on,
            elapsed_seconds: self.elapsed_seconds,
            reconnect_attempts: self.reconnect_attempts,
        }
    }

    /// Zusammenfassung, erst nach `Ended` verfügbar
    pub fn summary(&self, now: Instant) -> Option<CallSummary> {
        let end_reason = self.end_reason?;
        let duration_secs = self
            .started
            .map(|started| now.saturating_duration_since(started).as_secs())
            .unwrap_or(0);

        Some(CallSummary {
            call_id: self.id,
            started_at: self.started_at,
            duration_secs,
            reconnects: self.total_reconnects,
            end_reason,
            transcript: self.transcript.clone(),
        })
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}
