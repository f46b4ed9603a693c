//! Transport-Modul für die Verbindung zum Voice-Service
//!
//! Enthält die Wire-Messages und die WebSocket-Session.

mod messages;
mod session;

pub use messages::{
    DecodeError, EncodedAudioChunk, Modality, ParseError, ServerUpdate, TransportMessage,
};
pub use session::{
    ConnectError, SendError, Transport, TransportConfig, TransportEvent, TransportSession,
    TransportState, DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE,
};
