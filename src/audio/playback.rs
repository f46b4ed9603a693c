//! Audio Playback Engine - Lautsprecher
//!
//! Spielt empfangene Frames strikt in Ankunftsreihenfolge ab. Es läuft nie
//! mehr als eine Drain-Schleife gleichzeitig: das `draining`-Flag wird unter
//! demselben Lock gesetzt und gelöscht, unter dem die Queue verändert wird.

use super::format::{duration_to_samples, AudioFrame};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Standard-Obergrenze der PlaybackQueue
pub const DEFAULT_MAX_QUEUED: Duration = Duration::from_secs(10);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Failed to initialize playback device: {0}")]
    DeviceInit(String),

    #[error("Failed to write to playback device: {0}")]
    Write(String),
}

// ============================================================================
// DEVICE TRAITS
// ============================================================================

/// Ein geöffnetes Ausgabegerät
pub trait PlaybackDevice: Send + Sync {
    /// Übergibt einen Frame an das Gerät. Blockiert nicht.
    fn submit(&self, frame: &AudioFrame) -> Result<(), PlaybackError>;

    /// Blockiert bis alles Übergebene abgespielt oder per `halt` verworfen ist
    fn wait_idle(&self) -> Result<(), PlaybackError>;

    /// Bricht die laufende Ausgabe sofort ab
    fn halt(&self);
}

/// Öffnet Ausgabegeräte (24 kHz, Mono, 16-bit)
pub trait PlaybackBackend: Send + Sync {
    fn open(&self) -> Result<Arc<dyn PlaybackDevice>, PlaybackError>;
}

/// Events die von der PlaybackEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Gerät konnte nicht geöffnet werden; die Engine verwirft ab jetzt alles
    DeviceFailed { detail: String },
}

// ============================================================================
// PLAYBACK ENGINE
// ============================================================================

#[derive(Default)]
struct PlaybackState {
    queue: VecDeque<AudioFrame>,
    queued_samples: usize,
    draining: bool,
    device: Option<Arc<dyn PlaybackDevice>>,
    disabled: bool,
    dropped_frames: u64,
}

struct PlaybackInner {
    backend: Arc<dyn PlaybackBackend>,
    state: Mutex<PlaybackState>,
    max_queued_samples: usize,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

/// Handle auf die PlaybackEngine (günstig klonbar)
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<PlaybackInner>,
}

impl PlaybackEngine {
    pub fn new(
        backend: Arc<dyn PlaybackBackend>,
        max_queued: Duration,
        events: mpsc::UnboundedSender<PlaybackEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(PlaybackInner {
                backend,
                state: Mutex::new(PlaybackState::default()),
                max_queued_samples: duration_to_samples(max_queued).max(1),
                events,
            }),
        }
    }

    /// Hängt einen Frame an die Queue und startet bei Bedarf die Drain-Schleife
    pub fn enqueue(&self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }

        let mut state = self.inner.state.lock();
        if state.disabled {
            tracing::debug!("Playback disabled, dropping frame");
            return;
        }

        // Älteste Frames verwerfen, wenn die Obergrenze überschritten würde
        while !state.queue.is_empty()
            && state.queued_samples + frame.len() > self.inner.max_queued_samples
        {
            if let Some(oldest) = state.queue.pop_front() {
                state.queued_samples -= oldest.len();
                state.dropped_frames += 1;
                tracing::warn!("Playback queue full, dropping oldest frame");
            }
        }

        state.queued_samples += frame.len();
        state.queue.push_back(frame);

        if state.draining {
            return;
        }
        state.draining = true;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("playback-drain".to_string())
            .spawn(move || drain_loop(inner));

        if let Err(e) = spawned {
            tracing::error!("Failed to spawn playback thread: {}", e);
            let mut state = self.inner.state.lock();
            state.draining = false;
            state.queue.clear();
            state.queued_samples = 0;
        }
    }

    /// Leert die Queue und bricht die laufende Ausgabe sofort ab
    pub fn stop(&self) {
        let device = {
            let mut state = self.inner.state.lock();
            state.queue.clear();
            state.queued_samples = 0;
            state.device.clone()
        };

        if let Some(device) = device {
            device.halt();
        }
    }

    /// Wie `stop`, gibt zusätzlich das Gerät frei
    pub fn shutdown(&self) {
        let device = {
            let mut state = self.inner.state.lock();
            state.queue.clear();
            state.queued_samples = 0;
            state.disabled = true;
            state.device.take()
        };

        if let Some(device) = device {
            device.halt();
        }
        tracing::info!("Audio playback shut down");
    }

    /// Anzahl der wartenden Frames
    pub fn queued_frames(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// Anzahl der wegen Überlauf verworfenen Frames
    pub fn dropped_frames(&self) -> u64 {
        self.inner.state.lock().dropped_frames
    }
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PlaybackEngine")
            .field("queued", &state.queue.len())
            .field("draining", &state.draining)
            .field("disabled", &state.disabled)
            .finish()
    }
}

/// Gerät holen oder beim ersten Frame öffnen
fn ensure_device(inner: &PlaybackInner) -> Option<Arc<dyn PlaybackDevice>> {
    if let Some(device) = inner.state.lock().device.clone() {
        return Some(device);
    }

    // Nur die (einzige) Drain-Schleife öffnet das Gerät, daher kein Wettlauf
    match inner.backend.open() {
        Ok(device) => {
            let mut state = inner.state.lock();
            if state.disabled {
                return None;
            }
            state.device = Some(Arc::clone(&device));
            tracing::info!("Audio playback device opened");
            Some(device)
        }
        Err(e) => {
            tracing::error!("Playback device unavailable: {}", e);
            let mut state = inner.state.lock();
            state.disabled = true;
            state.queue.clear();
            state.queued_samples = 0;
            let _ = inner.events.send(PlaybackEvent::DeviceFailed {
                detail: e.to_string(),
            });
            None
        }
    }
}

fn drain_loop(inner: Arc<PlaybackInner>) {
    let Some(device) = ensure_device(&inner) else {
        inner.state.lock().draining = false;
        return;
    };

    loop {
        {
            let mut state = inner.state.lock();
            let Some(frame) = state.queue.pop_front() else {
                state.draining = false;
                break;
            };
            state.queued_samples -= frame.len();

            if state.disabled {
                continue;
            }

            // Übergabe unter dem Lock: ein stop() danach verwirft auch diesen Frame
            if let Err(e) = device.submit(&frame) {
                tracing::warn!("Dropping playback frame: {}", e);
                continue;
            }
        }

        if let Err(e) = device.wait_idle() {
            tracing::warn!("Playback frame interrupted: {}", e);
        }
    }

    tracing::debug!("Playback drain loop idle");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Gerät das Schreibvorgänge protokolliert und Überlappungen erkennt
    #[derive(Default)]
    struct RecordingDevice {
        played: Mutex<Vec<i16>>,
        in_flight: AtomicUsize,
        overlap: AtomicBool,
        fail_on: Option<i16>,
    }

    impl PlaybackDevice for RecordingDevice {
        fn submit(&self, frame: &AudioFrame) -> Result<(), PlaybackError> {
            if Some(frame.samples()[0]) == self.fail_on {
                return Err(PlaybackError::Write("boom".to_string()));
            }
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlap.store(true, Ordering::SeqCst);
            }
            self.played.lock().push(frame.samples()[0]);
            Ok(())
        }

        fn wait_idle(&self) -> Result<(), PlaybackError> {
            std::thread::sleep(Duration::from_millis(2));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn halt(&self) {}
    }

    struct RecordingBackend(Arc<RecordingDevice>);

    impl PlaybackBackend for RecordingBackend {
        fn open(&self) -> Result<Arc<dyn PlaybackDevice>, PlaybackError> {
            Ok(self.0.clone())
        }
    }

    struct BrokenBackend;

    impl PlaybackBackend for BrokenBackend {
        fn open(&self) -> Result<Arc<dyn PlaybackDevice>, PlaybackError> {
            Err(PlaybackError::DeviceInit("no speaker".to_string()))
        }
    }

    fn frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; 240])
    }

    fn wait_until_idle(engine: &PlaybackEngine) {
        for _ in 0..500 {
            if !engine.is_playing() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("playback never went idle");
    }

    #[test]
    fn test_frames_played_in_order_without_overlap() {
        let device = Arc::new(RecordingDevice::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(
            Arc::new(RecordingBackend(device.clone())),
            DEFAULT_MAX_QUEUED,
            tx,
        );

        // Aus mehreren Threads gleichzeitig einreihen, Reihenfolge pro Thread prüfen
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for i in 0..10 {
                        engine.enqueue(frame(t * 100 + i));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        wait_until_idle(&engine);

        let played = device.played.lock().clone();
        assert_eq!(played.len(), 40);
        for t in 0..4 {
            let per_thread: Vec<i16> = played.iter().copied().filter(|v| v / 100 == t).collect();
            assert_eq!(per_thread, (0..10).map(|i| t * 100 + i).collect::<Vec<_>>());
        }
        assert!(!device.overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_sequential_enqueue_keeps_exact_order() {
        let device = Arc::new(RecordingDevice::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(
            Arc::new(RecordingBackend(device.clone())),
            DEFAULT_MAX_QUEUED,
            tx,
        );

        for i in 0..20 {
            engine.enqueue(frame(i));
            if i % 7 == 0 {
                // Zwischendurch leerlaufen lassen, damit die Schleife neu startet
                wait_until_idle(&engine);
            }
        }
        wait_until_idle(&engine);

        assert_eq!(*device.played.lock(), (0..20).collect::<Vec<_>>());
        assert!(!device.overlap.load(Ordering::SeqCst));
    }

    #[test]
    fn test_write_failure_skips_frame() {
        let device = Arc::new(RecordingDevice {
            fail_on: Some(2),
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(
            Arc::new(RecordingBackend(device.clone())),
            DEFAULT_MAX_QUEUED,
            tx,
        );

        for i in 1..=3 {
            engine.enqueue(frame(i));
        }
        wait_until_idle(&engine);

        assert_eq!(*device.played.lock(), vec![1, 3]);
    }

    #[test]
    fn test_queue_bound_drops_oldest() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(Arc::new(BrokenBackend), Duration::from_millis(20), tx);

        // Direkt in der Queue prüfen, ohne Drain-Schleife
        {
            let mut state = engine.inner.state.lock();
            state.draining = true;
        }
        for i in 0..3 {
            // 240 Samples = 10ms, Grenze 20ms = 480 Samples
            engine.enqueue(frame(i));
        }

        let state = engine.inner.state.lock();
        let remaining: Vec<i16> = state.queue.iter().map(|f| f.samples()[0]).collect();
        assert_eq!(remaining, vec![1, 2]);
        assert_eq!(state.dropped_frames, 1);
    }

    #[test]
    fn test_device_init_failure_disables_engine() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(Arc::new(BrokenBackend), DEFAULT_MAX_QUEUED, tx);

        engine.enqueue(frame(1));
        wait_until_idle(&engine);

        assert!(matches!(
            rx.try_recv(),
            Ok(PlaybackEvent::DeviceFailed { .. })
        ));
        engine.enqueue(frame(2));
        assert_eq!(engine.queued_frames(), 0);
    }

    #[test]
    fn test_stop_clears_queue() {
        let device = Arc::new(RecordingDevice::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let engine = PlaybackEngine::new(
            Arc::new(RecordingBackend(device.clone())),
            DEFAULT_MAX_QUEUED,
            tx,
        );

        {
            engine.inner.state.lock().draining = true;
        }
        engine.enqueue(frame(1));
        engine.enqueue(frame(2));
        engine.stop();

        assert_eq!(engine.queued_frames(), 0);
        assert!(device.played.lock().is_empty());
    }
}
