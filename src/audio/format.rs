//! Audio-Format und Frames
//!
//! Das Format ist fest vorgegeben und nicht konfigurierbar:
//! 24 kHz, Mono, 16-bit signed PCM (Little Endian auf dem Draht).

use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate des Voice-Service (Senden und Empfangen)
pub const SAMPLE_RATE: u32 = 24_000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Bytes pro Sample (16-bit PCM)
pub const BYTES_PER_SAMPLE: usize = 2;

/// Frame Size in Samples (100ms @ 24kHz = 2400 samples)
pub const FRAME_SIZE: usize = 2_400;

/// MIME-Typ der Audio-Chunks im Protokoll
pub const PCM_MIME_TYPE: &str = "audio/pcm";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("PCM payload has odd length {0}, expected whole 16-bit samples")]
    OddLength(usize),
}

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein unveränderlicher Puffer mit PCM-Samples (24 kHz, Mono, i16).
///
/// Frames werden zwischen den Stufen verschoben, nicht kopiert.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// Erstellt einen Frame aus Little-Endian PCM-Bytes
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(FrameError::OddLength(bytes.len()));
        }

        let samples = bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        Ok(Self { samples })
    }

    /// Serialisiert die Samples als Little-Endian PCM-Bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * BYTES_PER_SAMPLE);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Abspieldauer des Frames bei 24 kHz
    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len())
    }
}

/// Rechnet eine Sample-Anzahl (24 kHz Mono) in eine Dauer um
pub fn samples_to_duration(samples: usize) -> Duration {
    Duration::from_micros(samples as u64 * 1_000_000 / SAMPLE_RATE as u64)
}

/// Rechnet eine Dauer in eine Sample-Anzahl (24 kHz Mono) um
pub fn duration_to_samples(duration: Duration) -> usize {
    (duration.as_micros() * SAMPLE_RATE as u128 / 1_000_000) as usize
}

// ============================================================================
// SAMPLE CONVERSION
// ============================================================================

/// f32 (-1.0..1.0) nach i16
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// i16 nach f32 (-1.0..1.0)
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

/// Einfaches Linear-Resampling
pub fn resample_linear(input: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || input.is_empty() {
        return input.to_vec();
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let new_len = (input.len() as f64 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f64 / ratio;
            let idx = src_idx as usize;
            let frac = (src_idx - idx as f64) as f32;
            let s1 = input.get(idx).copied().unwrap_or(0.0);
            let s2 = input.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}
