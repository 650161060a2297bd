//! Audio Handler - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. cpal-Streams sind nicht
//! `Send`; sie leben deshalb auf einem eigenen Thread, der bis `stop()`
//! blockiert. Mute-Status und Levels werden über geteilten State gelesen.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use thiserror::Error;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// SHARED STATE
// ============================================================================

#[derive(Default)]
struct AudioShared {
    is_muted: Mutex<bool>,
    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Mutex<f32>,
    output_level: Mutex<f32>,
}

// ============================================================================
// AUDIO HANDLER
// ============================================================================

/// Laufende Capture/Playback-Streams eines Anrufs
pub struct AudioHandler {
    shared: Arc<AudioShared>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl AudioHandler {
    /// Öffnet Standard-Input und -Output und startet beide Streams
    pub async fn start() -> Result<Self, AudioError> {
        let shared = Arc::new(AudioShared::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("pulse-audio".to_string())
            .spawn(move || {
                let streams = match AudioStreams::open(&thread_shared) {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis stop() oder Drop des Handlers
                let _ = stop_rx.recv();
                drop(streams);
                tracing::info!("Audio streams stopped");
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| AudioError::StreamBuildError("audio thread exited".to_string()))??;

        tracing::info!(
            "AudioHandler started: {}Hz, {} channel(s)",
            SAMPLE_RATE,
            CHANNELS
        );

        Ok(Self {
            shared,
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Stoppt alle Audio-Streams
    pub fn stop(&self) {
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
    }

    /// Setzt den Mute-Status
    pub fn set_muted(&self, muted: bool) {
        *self.shared.is_muted.lock() = muted;
        tracing::debug!("Audio muted: {}", muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        *self.shared.is_muted.lock()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn get_levels(&self) -> (f32, f32) {
        (
            *self.shared.input_level.lock(),
            *self.shared.output_level.lock(),
        )
    }
}

impl Drop for AudioHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// STREAMS (nur auf dem Audio-Thread)
// ============================================================================

struct AudioStreams {
    _input: Stream,
    _output: Stream,
}

impl AudioStreams {
    fn open(shared: &Arc<AudioShared>) -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let input_device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;
        let output_device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let input = Self::start_capture(&input_device, Arc::clone(shared))?;
        let output = Self::start_playback(&output_device, Arc::clone(shared))?;

        Ok(Self {
            _input: input,
            _output: output,
        })
    }

    /// Startet Audio Capture (Mikrofon)
    fn start_capture(device: &Device, shared: Arc<AudioShared>) -> Result<Stream, AudioError> {
        let config = find_best_config(
            device
                .supported_input_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if *shared.is_muted.lock() {
                        *shared.input_level.lock() = 0.0;
                        return;
                    }
                    *shared.input_level.lock() = rms(data);
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        Ok(stream)
    }

    /// Startet Audio Playback (Lautsprecher)
    fn start_playback(device: &Device, shared: Arc<AudioShared>) -> Result<Stream, AudioError> {
        let config = find_best_config(
            device
                .supported_output_configs()
                .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?
                .collect(),
        )?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    // TODO: Remote-Audio einspeisen, sobald ein Opus-Decoder angebunden ist
                    data.fill(0.0);
                    *shared.output_level.lock() = rms(data);
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
        Ok(stream)
    }
}

/// RMS eines Buffers, begrenzt auf 1.0
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let power = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    power.sqrt().min(1.0)
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 48kHz > andere, F32 > andere
fn find_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No F32 audio configuration found".to_string(),
    ))
}
