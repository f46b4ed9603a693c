//! cpal-Geräte für Mikrofon und Lautsprecher
//!
//! Verwendet cpal für Cross-Platform Audio I/O. `cpal::Stream` ist nicht
//! `Send`, daher lebt jeder Stream auf einem eigenen Thread; die Geräte
//! kommunizieren mit ihm nur über Ring-Buffer.

use super::capture::{CaptureBackend, CaptureDevice, CaptureError, ReadError};
use super::format::{f32_to_i16, i16_to_f32, resample_linear, AudioFrame, FRAME_SIZE, SAMPLE_RATE};
use super::playback::{PlaybackBackend, PlaybackDevice, PlaybackError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Capture-Puffer: 2 Sekunden bei 24 kHz
const CAPTURE_RING_SIZE: usize = SAMPLE_RATE as usize * 2;

/// Wie lange `read()` höchstens auf einen vollen Frame wartet
const READ_WAIT: Duration = Duration::from_millis(50);

/// Poll-Intervall für Ring-Buffer-Wartezeiten
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Obergrenze für ein einzelnes `wait_idle`
const MAX_FRAME_WAIT: Duration = Duration::from_secs(30);

// ============================================================================
// CONFIG SELECTION
// ============================================================================

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 24 kHz F32 > F32 mit bester Rate. cpal liefert die Samples
/// im Callback als f32, andere Formate werden nicht unterstützt.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Option<StreamConfig> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs: Vec<_> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    // Versuche exakt 24kHz zu finden, bevorzugt Mono
    let mut exact: Vec<_> = f32_configs
        .iter()
        .filter(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
        .collect();
    exact.sort_by_key(|c| c.channels());
    if let Some(config) = exact.first() {
        return Some((*config).clone().with_sample_rate(target_rate).into());
    }

    // Fallback: höchste verfügbare Rate, wird resampelt
    f32_configs
        .into_iter()
        .max_by_key(|c| c.max_sample_rate().0)
        .map(|c| c.with_max_sample_rate().into())
}

fn input_config(device: &Device) -> Result<StreamConfig, String> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| e.to_string())?;
    select_best_config(configs.collect())
        .ok_or_else(|| "No suitable input configuration found".to_string())
}

fn output_config(device: &Device) -> Result<StreamConfig, String> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| e.to_string())?;
    select_best_config(configs.collect())
        .ok_or_else(|| "No suitable output configuration found".to_string())
}

/// Hält einen Stream auf einem eigenen Thread am Leben.
///
/// `build` läuft auf dem Stream-Thread und liefert neben dem Stream einen
/// Wert für den Aufrufer. Der Thread endet, sobald der zurückgegebene
/// Sender gedroppt wird.
fn spawn_stream_thread<F, T>(
    name: &str,
    build: F,
) -> Result<(T, std_mpsc::Sender<()>, JoinHandle<()>), String>
where
    F: FnOnce() -> Result<(cpal::Stream, T), String> + Send + 'static,
    T: Send + 'static,
{
    let (ready_tx, ready_rx) = std_mpsc::channel::<Result<T, String>>();
    let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let started = build().and_then(|(stream, value)| {
                stream.play().map_err(|e| e.to_string())?;
                Ok((stream, value))
            });

            let stream = match started {
                Ok((stream, value)) => {
                    let _ = ready_tx.send(Ok(value));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Blockiert bis der Sender gedroppt wird
            let _ = shutdown_rx.recv();
            drop(stream);
        })
        .map_err(|e| e.to_string())?;

    match ready_rx.recv() {
        Ok(Ok(value)) => Ok((value, shutdown_tx, handle)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err("Audio stream thread exited unexpectedly".to_string())
        }
    }
}

// ============================================================================
// CAPTURE (MIKROFON)
// ============================================================================

/// Default-Mikrofon des Systems
#[derive(Debug, Default)]
pub struct CpalCapture;

impl CaptureBackend for CpalCapture {
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CaptureError> {
        Ok(Box::new(CpalInput::open()?))
    }
}

/// Geöffnetes Mikrofon; Samples laufen über einen Ring-Buffer
pub struct CpalInput {
    buffer: Arc<Mutex<HeapRb<i16>>>,
    stream_error: Arc<Mutex<Option<ReadError>>>,
    shutdown: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    pub fn open() -> Result<Self, CaptureError> {
        let buffer = Arc::new(Mutex::new(HeapRb::<i16>::new(CAPTURE_RING_SIZE)));
        let stream_error = Arc::new(Mutex::new(None));

        let capture_buffer = Arc::clone(&buffer);
        let error_slot = Arc::clone(&stream_error);

        let ((), shutdown, thread) = spawn_stream_thread("audio-input", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| "No audio input device found".to_string())?;
            let config = input_config(&device)?;

            tracing::info!(
                "Starting audio capture: {} Hz, {} channels",
                config.sample_rate.0,
                config.channels
            );

            let source_rate = config.sample_rate.0;
            let channels = config.channels.max(1) as usize;

            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        // Downmix auf Mono
                        let mono: Vec<f32> = data
                            .chunks(channels)
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                            .collect();

                        // Resampling falls nötig (zu 24kHz)
                        let samples = resample_linear(&mono, source_rate, SAMPLE_RATE);

                        let mut buffer = capture_buffer.lock();
                        for sample in samples {
                            // Bei Überlauf gehen die neuesten Samples verloren
                            let _ = buffer.try_push(f32_to_i16(sample));
                        }
                    },
                    move |err| {
                        tracing::error!("Audio capture error: {}", err);
                        let read_error = match err {
                            cpal::StreamError::DeviceNotAvailable => {
                                ReadError::Fatal(err.to_string())
                            }
                            _ => ReadError::Transient(err.to_string()),
                        };
                        *error_slot.lock() = Some(read_error);
                    },
                    None,
                )
                .map_err(|e| e.to_string())?;

            Ok((stream, ()))
        })
        .map_err(CaptureError::DeviceInit)?;

        Ok(Self {
            buffer,
            stream_error,
            shutdown: Some(shutdown),
            thread: Some(thread),
        })
    }
}

impl CaptureDevice for CpalInput {
    fn read(&mut self) -> Result<Option<AudioFrame>, ReadError> {
        if let Some(err) = self.stream_error.lock().take() {
            return Err(err);
        }

        let deadline = Instant::now() + READ_WAIT;
        loop {
            {
                let mut buffer = self.buffer.lock();
                if buffer.occupied_len() >= FRAME_SIZE {
                    let mut samples = Vec::with_capacity(FRAME_SIZE);
                    for _ in 0..FRAME_SIZE {
                        if let Some(sample) = buffer.try_pop() {
                            samples.push(sample);
                        }
                    }
                    return Ok(Some(AudioFrame::new(samples)));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        // Sender droppen beendet den Stream-Thread
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

// ============================================================================
// PLAYBACK (LAUTSPRECHER)
// ============================================================================

/// Default-Lautsprecher des Systems
#[derive(Debug, Default)]
pub struct CpalPlayback;

impl PlaybackBackend for CpalPlayback {
    fn open(&self) -> Result<Arc<dyn PlaybackDevice>, PlaybackError> {
        Ok(Arc::new(CpalOutput::open()?))
    }
}

/// Geöffneter Lautsprecher
pub struct CpalOutput {
    buffer: Arc<Mutex<HeapRb<f32>>>,
    device_rate: u32,
    halted: AtomicBool,
    shutdown: Mutex<Option<std_mpsc::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalOutput {
    pub fn open() -> Result<Self, PlaybackError> {
        let (output, shutdown, thread) = spawn_stream_thread("audio-output", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| "No audio output device found".to_string())?;
            let config = output_config(&device)?;
            let device_rate = config.sample_rate.0;

            tracing::info!(
                "Starting audio playback: {} Hz, {} channels",
                device_rate,
                config.channels
            );

            // 10 Sekunden bei Geräterate
            let buffer = Arc::new(Mutex::new(HeapRb::<f32>::new(device_rate as usize * 10)));
            let playback_buffer = Arc::clone(&buffer);
            let channels = config.channels.max(1) as usize;

            let stream = device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut buffer = playback_buffer.lock();
                        // Mono auf alle Kanäle verteilen, Stille bei leerem Buffer
                        for frame in data.chunks_mut(channels) {
                            let sample = buffer.try_pop().unwrap_or(0.0);
                            for s in frame.iter_mut() {
                                *s = sample;
                            }
                        }
                    },
                    |err| {
                        tracing::error!("Audio playback error: {}", err);
                    },
                    None,
                )
                .map_err(|e| e.to_string())?;

            Ok((stream, (buffer, device_rate)))
        })
        .map_err(PlaybackError::DeviceInit)?;

        let (buffer, device_rate) = output;
        Ok(Self {
            buffer,
            device_rate,
            halted: AtomicBool::new(false),
            shutdown: Mutex::new(Some(shutdown)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl PlaybackDevice for CpalOutput {
    fn submit(&self, frame: &AudioFrame) -> Result<(), PlaybackError> {
        self.halted.store(false, Ordering::SeqCst);

        let samples: Vec<f32> = frame.samples().iter().copied().map(i16_to_f32).collect();
        let samples = resample_linear(&samples, SAMPLE_RATE, self.device_rate);

        let mut buffer = self.buffer.lock();
        let mut dropped = 0usize;
        for sample in samples {
            if buffer.try_push(sample).is_err() {
                dropped += 1;
            }
        }

        if dropped > 0 {
            return Err(PlaybackError::Write(format!(
                "output buffer full, {dropped} samples dropped"
            )));
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), PlaybackError> {
        let deadline = Instant::now() + MAX_FRAME_WAIT;
        loop {
            if self.halted.load(Ordering::SeqCst) || self.buffer.lock().occupied_len() == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(PlaybackError::Write("output stalled".to_string()));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        let mut buffer = self.buffer.lock();
        while buffer.try_pop().is_some() {}
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

/// Repräsentiert ein Audio-Gerät
#[derive(Debug, Clone, serde::Serialize)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// Gibt alle verfügbaren Audio-Geräte zurück (input, output)
pub fn list_devices() -> Result<(Vec<AudioDeviceInfo>, Vec<AudioDeviceInfo>), String> {
    let host = cpal::default_host();

    let default_input = host.default_input_device().and_then(|d| d.name().ok());
    let default_output = host.default_output_device().and_then(|d| d.name().ok());

    let input_devices = host
        .input_devices()
        .map_err(|e| e.to_string())?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDeviceInfo {
                is_default: Some(&name) == default_input.as_ref(),
                name,
            })
        })
        .collect();

    let output_devices = host
        .output_devices()
        .map_err(|e| e.to_string())?
        .filter_map(|d| {
            d.name().ok().map(|name| AudioDeviceInfo {
                is_default: Some(&name) == default_output.as_ref(),
                name,
            })
        })
        .collect();

    Ok((input_devices, output_devices))
}
