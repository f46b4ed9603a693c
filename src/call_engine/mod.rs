//! Call Engine Module - Anruf-Logik
//!
//! Dieses Modul verwaltet:
//! - Den Zustand eines Anrufs (CallSession)
//! - Den Call Controller, der Mikrofon, Lautsprecher und Transport verbindet
//! - Die Reconnect-Policy und die Gesprächsdauer

mod engine;
mod session;

pub use engine::{CallController, CallDeps, CallError, CallEvent, CallFailure, CallPolicy};
pub use session::{
    CallSession, CallSnapshot, CallState, CallSummary, DisconnectOutcome, EndReason,
    TranscriptEntry,
};
