//! Message Types für das Voice-Protokoll
//!
//! Diese Strukturen bilden die JSON-Frames des Voice-Service ab und
//! ermöglichen typsichere Kommunikation. Ausgehend gibt es nur `Setup` und
//! `RealtimeInput`, eingehend nur `ServerUpdate`.

use crate::audio::{AudioFrame, FrameError, PCM_MIME_TYPE};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler beim Parsen eines eingehenden Frames (nicht fatal)
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame carries neither text nor audio")]
    Empty,
}

/// Fehler beim Dekodieren eines Audio-Chunks
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Unsupported audio MIME type: {0}")]
    MimeType(String),

    #[error("Invalid base64 audio payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ============================================================================
// HELPER TYPES
// ============================================================================

/// Antwort-Modalitäten, die beim Setup angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Base64-kodierter PCM-Frame mit MIME-Typ (nur auf dem Draht)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedAudioChunk {
    pub mime_type: String,
    pub data: String,
}

impl EncodedAudioChunk {
    /// Kodiert einen Frame als `audio/pcm` Chunk
    pub fn encode(frame: &AudioFrame) -> Self {
        Self {
            mime_type: PCM_MIME_TYPE.to_string(),
            data: BASE64.encode(frame.to_le_bytes()),
        }
    }

    /// Dekodiert den Chunk zurück in einen Frame
    pub fn decode(&self) -> Result<AudioFrame, DecodeError> {
        // Parameter wie `audio/pcm;rate=24000` sind erlaubt
        let base_type = self.mime_type.split(';').next().unwrap_or_default().trim();
        if base_type != PCM_MIME_TYPE {
            return Err(DecodeError::MimeType(self.mime_type.clone()));
        }

        // Manche Encoder brechen Base64 in Zeilen um
        let compact: String = self.data.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = BASE64.decode(compact)?;
        Ok(AudioFrame::from_le_bytes(&bytes)?)
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle ausgehenden Nachrichten
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    /// Einmalig als erste Nachricht nach dem Verbindungsaufbau
    Setup {
        desired_response_modalities: BTreeSet<Modality>,
    },

    /// Audio vom Mikrofon; `end_of_stream` beendet nur das aktuelle Segment
    RealtimeInput {
        media_chunks: Vec<EncodedAudioChunk>,
        end_of_stream: bool,
    },
}

impl TransportMessage {
    /// Setup mit den gegebenen Modalitäten
    pub fn setup(modalities: impl IntoIterator<Item = Modality>) -> Self {
        Self::Setup {
            desired_response_modalities: modalities.into_iter().collect(),
        }
    }

    /// Ein einzelner Audio-Frame
    pub fn audio(frame: &AudioFrame) -> Self {
        Self::RealtimeInput {
            media_chunks: vec![EncodedAudioChunk::encode(frame)],
            end_of_stream: false,
        }
    }

    /// Ende des aktuellen Aufnahme-Segments
    pub fn end_of_stream() -> Self {
        Self::RealtimeInput {
            media_chunks: Vec::new(),
            end_of_stream: true,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            Self::RealtimeInput {
                end_of_stream: true,
                ..
            }
        )
    }

    /// Serialisiert die Nachricht als JSON-Text-Frame
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Setup {
                desired_response_modalities,
            } => serde_json::to_string(&SetupFrame {
                setup: SetupBody {
                    generation_config: GenerationConfig {
                        response_modalities: desired_response_modalities,
                    },
                },
            }),
            Self::RealtimeInput {
                media_chunks,
                end_of_stream,
            } => serde_json::to_string(&RealtimeFrame {
                realtime_input: RealtimeBody { media_chunks },
                end_of_stream: *end_of_stream,
            }),
        }
    }
}

#[derive(Serialize)]
struct SetupFrame<'a> {
    setup: SetupBody<'a>,
}

#[derive(Serialize)]
struct SetupBody<'a> {
    generation_config: GenerationConfig<'a>,
}

#[derive(Serialize)]
struct GenerationConfig<'a> {
    response_modalities: &'a BTreeSet<Modality>,
}

#[derive(Serialize)]
struct RealtimeFrame<'a> {
    realtime_input: RealtimeBody<'a>,
    #[serde(skip_serializing_if = "is_false")]
    end_of_stream: bool,
}

#[derive(Serialize)]
struct RealtimeBody<'a> {
    media_chunks: &'a [EncodedAudioChunk],
}

fn is_false(value: &bool) -> bool {
    !*value
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Eingehendes Update; `text` und `audio` sind unabhängig voneinander optional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerUpdate {
    pub text: Option<String>,
    pub audio: Option<EncodedAudioChunk>,
}

/// Rohform auf dem Draht: `{"text"?: string, "audio"?: "<base64>"}`
#[derive(Deserialize)]
struct ServerFrame {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio: Option<String>,
}

impl ServerUpdate {
    /// Parst einen eingehenden Text-Frame
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let frame: ServerFrame = serde_json::from_str(raw)?;

        if frame.text.is_none() && frame.audio.is_none() {
            return Err(ParseError::Empty);
        }

        Ok(Self {
            text: frame.text,
            audio: frame.audio.map(|data| EncodedAudioChunk {
                mime_type: PCM_MIME_TYPE.to_string(),
                data,
            }),
        })
    }
}
