//! Airing Call - Realtime Voice-Call Engine
//!
//! Die Sprach-Verbindung des Airing Tagebuch-Begleiters mit:
//! - Mikrofon-Aufnahme und Lautsprecher-Wiedergabe über cpal
//! - WebSocket-Session zum AI Voice-Service
//! - Call Controller mit Reconnect-Policy und Gesprächsdauer
//! - Befehls-/Event-Schnittstelle für die Oberfläche

pub mod audio;
pub mod bridge;
pub mod call_engine;
pub mod config;
pub mod transport;

pub use bridge::{AiCallModule, AudioInfo, BridgeError, UiEvent};
pub use call_engine::{CallController, CallEvent, CallState, CallSummary};
pub use config::{CallConfig, ConfigError};

use tracing_subscriber::EnvFilter;

/// Initialisiert das Logging (`RUST_LOG` wird berücksichtigt).
///
/// Mehrfacher Aufruf ist erlaubt; nur der erste installiert den Subscriber.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    for directive in ["airing_call=debug", "airing_call_lib=debug", "tungstenite=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
    {
        tracing::info!("Initializing Airing Call...");
    }
}
