//! Audio Capture Engine - Mikrofon
//!
//! Liest in einer Schleife auf einem eigenen Thread Puffer vom Mikrofon und
//! liefert sie als [`AudioFrame`]s an genau einen Consumer (den Call
//! Controller). Jeder `start()` eröffnet ein neues Aufnahme-Segment; Frames
//! eines beendeten Segments werden nach `stop()` nie mehr ausgeliefert.

use super::format::AudioFrame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Failed to initialize capture device: {0}")]
    DeviceInit(String),

    #[error("Failed to spawn capture thread: {0}")]
    Thread(String),
}

/// Fehler beim Lesen eines Puffers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// Einzelner Lesefehler, die Schleife läuft weiter
    #[error("transient read error: {0}")]
    Transient(String),

    /// Gerät ist weg, die Schleife wird beendet
    #[error("fatal device error: {0}")]
    Fatal(String),
}

// ============================================================================
// DEVICE TRAITS
// ============================================================================

/// Ein geöffnetes Eingabegerät
pub trait CaptureDevice: Send {
    /// Liest einen Puffer.
    ///
    /// Darf nur kurz blockieren; `Ok(None)` bedeutet, dass noch kein
    /// vollständiger Puffer vorliegt.
    fn read(&mut self) -> Result<Option<AudioFrame>, ReadError>;
}

/// Öffnet Eingabegeräte (24 kHz, Mono, 16-bit)
pub trait CaptureBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError>;
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events die von der CaptureEngine ausgelöst werden
#[derive(Debug)]
pub enum CaptureEvent {
    /// Ein aufgenommener Frame, mit dem Segment in dem er gelesen wurde
    Frame { segment: u64, frame: AudioFrame },

    /// Das Gerät ist ausgefallen, die Aufnahme wurde beendet
    Failed { segment: u64, detail: String },
}

// ============================================================================
// CAPTURE ENGINE
// ============================================================================

#[derive(Debug, Default)]
struct CaptureShared {
    /// Aktuelles Segment; wird bei jedem start() und stop() erhöht
    epoch: u64,
    running: bool,
}

pub struct CaptureEngine {
    backend: Arc<dyn CaptureBackend>,
    shared: Arc<Mutex<CaptureShared>>,
    sink: mpsc::UnboundedSender<CaptureEvent>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn CaptureBackend>, sink: mpsc::UnboundedSender<CaptureEvent>) -> Self {
        Self {
            backend,
            shared: Arc::new(Mutex::new(CaptureShared::default())),
            sink,
            worker: None,
        }
    }

    /// Startet die Aufnahme.
    ///
    /// No-op wenn bereits gestartet. Schlägt mit [`CaptureError::DeviceInit`]
    /// fehl, wenn das Gerät nicht geöffnet werden kann.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.shared.lock().running {
            return Ok(());
        }

        // Worker eines ausgefallenen Segments einsammeln
        self.join_worker();

        let device = self.backend.open()?;

        let segment = {
            let mut shared = self.shared.lock();
            shared.epoch += 1;
            shared.running = true;
            shared.epoch
        };

        let shared = Arc::clone(&self.shared);
        let sink = self.sink.clone();

        let handle = thread::Builder::new()
            .name(format!("capture-segment-{segment}"))
            .spawn(move || read_loop(device, segment, shared, sink))
            .map_err(|e| {
                self.shared.lock().running = false;
                CaptureError::Thread(e.to_string())
            })?;

        self.worker = Some(handle);
        tracing::info!("Audio capture started (segment {})", segment);
        Ok(())
    }

    /// Stoppt die Aufnahme und gibt das Gerät frei. Idempotent.
    ///
    /// Blockiert, bis der Lese-Thread beendet ist. Danach liegen alle Frames
    /// des beendeten Segments bereits im Event-Kanal.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        let was_running = self.halt();
        self.join_worker();

        if was_running {
            tracing::info!("Audio capture stopped");
        }
        Ok(())
    }

    /// Wie [`stop`](Self::stop), wartet aber auf dem Blocking-Pool statt
    /// den Runtime-Thread anzuhalten.
    pub async fn stop_async(&mut self) -> Result<(), CaptureError> {
        let was_running = self.halt();

        if let Some(handle) = self.worker.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Capture thread panicked"),
                Err(e) => {
                    return Err(CaptureError::Thread(format!(
                        "failed to join capture thread: {e}"
                    )))
                }
            }
        }

        if was_running {
            tracing::info!("Audio capture stopped");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().running
    }

    /// Segment der laufenden (oder zuletzt gestarteten) Aufnahme
    pub fn segment(&self) -> u64 {
        self.shared.lock().epoch
    }

    /// Beendet das laufende Segment; ab hier verwirft der Worker jeden Frame
    fn halt(&mut self) -> bool {
        let mut shared = self.shared.lock();
        let was_running = shared.running;
        if was_running {
            shared.epoch += 1;
            shared.running = false;
        }
        was_running
    }

    fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

impl std::fmt::Debug for CaptureEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureEngine")
            .field("shared", &*self.shared.lock())
            .finish()
    }
}

/// Leseschleife auf dem Capture-Thread
fn read_loop(
    mut device: Box<dyn CaptureDevice>,
    segment: u64,
    shared: Arc<Mutex<CaptureShared>>,
    sink: mpsc::UnboundedSender<CaptureEvent>,
) {
    loop {
        if shared.lock().epoch != segment {
            break;
        }

        match device.read() {
            Ok(Some(frame)) => {
                // Prüfen und Senden unter dem Lock: nach stop() kommt nichts mehr durch
                let shared = shared.lock();
                if shared.epoch != segment {
                    break;
                }
                if sink.send(CaptureEvent::Frame { segment, frame }).is_err() {
                    tracing::debug!("Capture consumer gone, ending read loop");
                    break;
                }
            }
            Ok(None) => {}
            Err(ReadError::Transient(detail)) => {
                tracing::warn!("Transient capture read error: {}", detail);
            }
            Err(ReadError::Fatal(detail)) => {
                tracing::error!("Capture device failed: {}", detail);
                let mut shared = shared.lock();
                if shared.epoch == segment {
                    shared.running = false;
                    let _ = sink.send(CaptureEvent::Failed { segment, detail });
                }
                break;
            }
        }
    }

    // device wird hier gedroppt und damit freigegeben
    drop(device);
    tracing::debug!("Capture read loop for segment {} finished", segment);
}
