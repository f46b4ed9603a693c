//! Audio Module - Mikrofon und Lautsprecher
//!
//! Dieses Modul verwaltet:
//! - Das feste Audio-Format (24 kHz, Mono, 16-bit PCM)
//! - Die Capture Engine (Mikrofon → Frames)
//! - Die Playback Engine (Frames → Lautsprecher)
//! - cpal-Geräte für beide Richtungen

mod capture;
mod device;
mod format;
mod playback;

pub use capture::{
    CaptureBackend, CaptureDevice, CaptureEngine, CaptureError, CaptureEvent, ReadError,
};
pub use device::{list_devices, AudioDeviceInfo, CpalCapture, CpalInput, CpalOutput, CpalPlayback};
pub use format::{
    duration_to_samples, samples_to_duration, AudioFrame, FrameError, BYTES_PER_SAMPLE, CHANNELS,
    FRAME_SIZE, PCM_MIME_TYPE, SAMPLE_RATE,
};
pub use playback::{
    PlaybackBackend, PlaybackDevice, PlaybackEngine, PlaybackError, PlaybackEvent,
    DEFAULT_MAX_QUEUED,
};
