//! Gemeinsame Test-Doubles für die Integrationstests

#![allow(dead_code)]

use airing_call_lib::audio::{
    AudioFrame, CaptureBackend, CaptureDevice, CaptureError, PlaybackBackend, PlaybackDevice,
    PlaybackError, ReadError,
};
use airing_call_lib::call_engine::{CallEvent, CallPolicy};
use airing_call_lib::transport::{
    ConnectError, SendError, ServerUpdate, Transport, TransportEvent, TransportMessage,
    TransportState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// Policy mit kurzen Zeiten für Tests
pub fn fast_policy() -> CallPolicy {
    CallPolicy {
        max_reconnect_attempts: 3,
        reconnect_delay: Duration::from_millis(20),
        tick_interval: Duration::from_millis(50),
        ..CallPolicy::default()
    }
}

/// Wartet auf das erste Event, das `pred` erfüllt
pub async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<CallEvent>,
    mut pred: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

/// Pollt `cond` bis es erfüllt ist
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition")
}

pub fn frame(marker: i16) -> AudioFrame {
    AudioFrame::new(vec![marker; 240])
}

// ============================================================================
// FAKE MICROPHONE
// ============================================================================

/// Mikrofon, das Frames aus einem Kanal liest, den der Test befüllt
#[derive(Clone)]
pub struct FakeMic {
    frames: Arc<Mutex<std_mpsc::Receiver<AudioFrame>>>,
    feed: std_mpsc::Sender<AudioFrame>,
    pub opens: Arc<AtomicUsize>,
    pub fail_open: Arc<AtomicBool>,
}

impl FakeMic {
    pub fn new() -> Self {
        let (feed, frames) = std_mpsc::channel();
        Self {
            frames: Arc::new(Mutex::new(frames)),
            feed,
            opens: Arc::new(AtomicUsize::new(0)),
            fail_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn push(&self, frame: AudioFrame) {
        self.feed.send(frame).unwrap();
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct FakeMicDevice {
    frames: Arc<Mutex<std_mpsc::Receiver<AudioFrame>>>,
}

impl CaptureDevice for FakeMicDevice {
    fn read(&mut self) -> Result<Option<AudioFrame>, ReadError> {
        match self.frames.lock().recv_timeout(Duration::from_millis(5)) {
            Ok(frame) => Ok(Some(frame)),
            Err(std_mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                Err(ReadError::Fatal("feed closed".to_string()))
            }
        }
    }
}

impl CaptureBackend for FakeMic {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceInit("no microphone".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicDevice {
            frames: Arc::clone(&self.frames),
        }))
    }
}

// ============================================================================
// RECORDING SPEAKER
// ============================================================================

/// Lautsprecher, der abgespielte Frames mitschreibt und Überlappung erkennt
#[derive(Default)]
pub struct RecordingSpeaker {
    pub played: Mutex<Vec<Vec<i16>>>,
    pub halts: AtomicUsize,
    in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
}

impl RecordingSpeaker {
    pub fn played_markers(&self) -> Vec<i16> {
        self.played.lock().iter().map(|samples| samples[0]).collect()
    }
}

impl PlaybackDevice for RecordingSpeaker {
    fn submit(&self, frame: &AudioFrame) -> Result<(), PlaybackError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.played.lock().push(frame.samples().to_vec());
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), PlaybackError> {
        std::thread::sleep(Duration::from_millis(2));
        self.in_flight.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct SpeakerBackend {
    pub speaker: Arc<RecordingSpeaker>,
}

impl PlaybackBackend for SpeakerBackend {
    fn open(&self) -> Result<Arc<dyn PlaybackDevice>, PlaybackError> {
        Ok(Arc::clone(&self.speaker) as Arc<dyn PlaybackDevice>)
    }
}

// ============================================================================
// FAKE TRANSPORT
// ============================================================================

#[derive(Default)]
struct FakeTransportState {
    state: Option<TransportState>,
    connects: Vec<String>,
    sent: Vec<TransportMessage>,
    closes: usize,
}

/// Transport, den der Test steuert und der alle Aufrufe mitschreibt
pub struct FakeTransport {
    inner: Mutex<FakeTransportState>,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Jeder `connect` schlägt sofort (asynchron) fehl
    pub fail_connects: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inner: Mutex::new(FakeTransportState::default()),
            events,
            fail_connects: AtomicBool::new(false),
        });
        (transport, rx)
    }

    /// Simuliert den erfolgreichen Verbindungsaufbau
    pub fn open(&self) {
        self.inner.lock().state = Some(TransportState::Open);
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Simuliert einen Verbindungsabbruch durch das Netzwerk
    pub fn drop_connection(&self, reason: &str) {
        self.inner.lock().state = Some(TransportState::Closed);
        let _ = self.events.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    pub fn deliver(&self, update: ServerUpdate) {
        let _ = self.events.send(TransportEvent::ServerUpdate(update));
    }

    pub fn connects(&self) -> Vec<String> {
        self.inner.lock().connects.clone()
    }

    pub fn sent(&self) -> Vec<TransportMessage> {
        self.inner.lock().sent.clone()
    }

    pub fn closes(&self) -> usize {
        self.inner.lock().closes
    }
}

impl Transport for FakeTransport {
    fn connect(&self, url: &str) -> Result<(), ConnectError> {
        let mut inner = self.inner.lock();
        inner.connects.push(url.to_string());

        if self.fail_connects.load(Ordering::SeqCst) {
            inner.state = Some(TransportState::Closed);
            let _ = self.events.send(TransportEvent::Error {
                detail: "connection refused".to_string(),
            });
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: "connection failed".to_string(),
            });
        } else {
            inner.state = Some(TransportState::Connecting);
        }
        Ok(())
    }

    fn send(&self, message: TransportMessage) -> Result<(), SendError> {
        let mut inner = self.inner.lock();
        if inner.state != Some(TransportState::Open) {
            return Err(SendError::NotConnected);
        }
        inner.sent.push(message);
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closes += 1;
        if inner.state.is_some_and(|state| state != TransportState::Closed) {
            inner.state = Some(TransportState::Closed);
            let _ = self.events.send(TransportEvent::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
    }

    fn state(&self) -> TransportState {
        self.inner.lock().state.unwrap_or(TransportState::Closed)
    }
}

/// Zählt Audio-Nachrichten und end_of_stream Nachrichten
pub fn count_messages(sent: &[TransportMessage]) -> (usize, usize) {
    let eos = sent.iter().filter(|m| m.is_end_of_stream()).count();
    let audio = sent
        .iter()
        .filter(|m| matches!(m, TransportMessage::RealtimeInput { media_chunks, .. } if !media_chunks.is_empty()))
        .count();
    (audio, eos)
}

/// Marker (erstes Sample) jeder gesendeten Audio-Nachricht
pub fn sent_markers(sent: &[TransportMessage]) -> Vec<i16> {
    sent.iter()
        .filter_map(|m| match m {
            TransportMessage::RealtimeInput { media_chunks, .. } => media_chunks.first(),
            _ => None,
        })
        .map(|chunk| chunk.decode().unwrap().samples()[0])
        .collect()
}
