//! Audio Capture - Mikrofon oder WAV-Datei als ausgehender Track
//!
//! Die Capture-Quelle ist ein prozessweiter Singleton: [`init_capture`]
//! öffnet sie beim ersten Aufruf, jede Session bekommt einen Klon des
//! Streams.
//! Gesendet wird PCMU (G.711 µ-law, 8 kHz) in 20ms Frames, damit kein
//! Opus-Encoder nötig ist.
//!
//! Mikrofon-Capture verwendet cpal und ist hinter dem Feature
//! `microphone`; die Datei-Quelle (hound) ist immer verfügbar.

use super::media::{LocalStream, LocalTrack};
use crate::config::CaptureSource;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate von PCMU
pub const SAMPLE_RATE: u32 = 8000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Dauer eines RTP-Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Frame Size in Samples (20ms @ 8kHz = 160 samples)
pub const FRAME_SIZE: usize = 160;

/// µ-law Codewort für 0.0
pub const MULAW_SILENCE: u8 = 0xFF;

/// Stream-ID des Capture-Streams
pub const CAPTURE_STREAM_ID: &str = "pulse-capture";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Microphone capture not compiled in (enable feature `microphone`)")]
    MicrophoneUnavailable,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to read capture file: {0}")]
    CaptureFile(#[from] hound::Error),

    #[error("Audio capture needs a running tokio runtime")]
    NoRuntime,
}

// ============================================================================
// PCMU
// ============================================================================

/// Codec-Beschreibung für alle Tracks dieses Crates
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_string(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        ..Default::default()
    }
}

/// Kodiert ein Sample (-1.0..=1.0) nach G.711 µ-law
pub fn encode_mulaw(sample: f32) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(CLIP) + BIAS;

    let exponent = (7 - (pcm as u32).leading_zeros().saturating_sub(17).min(7)) as i32;
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;

    !((sign | (exponent << 4) | mantissa) as u8)
}

pub fn encode_frame(samples: &[f32]) -> Bytes {
    samples.iter().map(|s| encode_mulaw(*s)).collect::<Vec<u8>>().into()
}

pub fn silence_frame() -> Bytes {
    Bytes::from(vec![MULAW_SILENCE; FRAME_SIZE])
}

/// Schreibt einen kodierten Frame in den Track
pub async fn write_frame(track: &LocalTrack, data: Bytes) -> Result<(), webrtc::Error> {
    track
        .sample_track()
        .write_sample(&Sample {
            data,
            duration: FRAME_DURATION,
            ..Default::default()
        })
        .await
}

/// Einfaches Linear-Resampling
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || data.is_empty() {
        return data.to_vec();
    }

    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

/// Interleaved Multichannel → Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

// ============================================================================
// FRAME SOURCES
// ============================================================================

/// Liefert PCM-Frames mit [`SAMPLE_RATE`]
trait FrameSource: Send {
    fn next_frame(&mut self, frame: &mut [f32]);
}

/// WAV-Datei, wird in Schleife abgespielt (Debug-Override statt Mikrofon)
struct FileSource {
    samples: Vec<f32>,
    position: usize,
}

impl FileSource {
    fn open(path: &Path) -> Result<Self, AudioError> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();

        let raw: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let mono = downmix(&raw, spec.channels as usize);
        let samples = resample_linear(&mono, spec.sample_rate, SAMPLE_RATE);

        tracing::info!(
            "Capture file {:?}: {} Hz, {} channel(s), {} samples after resampling",
            path,
            spec.sample_rate,
            spec.channels,
            samples.len()
        );

        Ok(Self {
            samples,
            position: 0,
        })
    }
}

impl FrameSource for FileSource {
    fn next_frame(&mut self, frame: &mut [f32]) {
        if self.samples.is_empty() {
            frame.fill(0.0);
            return;
        }
        for slot in frame.iter_mut() {
            *slot = self.samples[self.position];
            self.position = (self.position + 1) % self.samples.len();
        }
    }
}

#[cfg(feature = "microphone")]
mod microphone {
    //! cpal Input-Stream; der Stream ist nicht Send und lebt deshalb auf
    //! einem eigenen Thread bis zum Prozessende.

    use super::{downmix, resample_linear, AudioError, FrameSource, FRAME_SIZE, SAMPLE_RATE};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
    use parking_lot::Mutex;
    use ringbuf::{traits::*, HeapRb};
    use std::sync::Arc;

    /// Buffer Size für den Capture-Ring-Buffer
    const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

    pub(super) struct MicrophoneSource {
        buffer: Arc<Mutex<HeapRb<f32>>>,
    }

    impl MicrophoneSource {
        pub(super) fn open() -> Result<Self, AudioError> {
            let buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();

            let capture_buffer = Arc::clone(&buffer);
            std::thread::Builder::new()
                .name("pulse-capture".to_string())
                .spawn(move || match build_input_stream(capture_buffer) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        // Stream bis Prozessende am Leben halten
                        let _stream = stream;
                        loop {
                            std::thread::park();
                        }
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

            ready_rx
                .recv()
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))??;

            Ok(Self { buffer })
        }
    }

    impl FrameSource for MicrophoneSource {
        fn next_frame(&mut self, frame: &mut [f32]) {
            let mut buffer = self.buffer.lock();
            for slot in frame.iter_mut() {
                *slot = buffer.try_pop().unwrap_or(0.0);
            }
        }
    }

    fn build_input_stream(buffer: Arc<Mutex<HeapRb<f32>>>) -> Result<cpal::Stream, AudioError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(AudioError::NoInputDevice)?;

        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;
        let config = select_best_config(configs.collect())?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let source_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mono = downmix(data, channels);
                    let samples = resample_linear(&mono, source_sample_rate, SAMPLE_RATE);

                    let mut buffer = buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
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

    /// Wählt die beste F32-Konfiguration, möglichst nah an 48kHz
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, AudioError> {
        let target_rate = cpal::SampleRate(48000);

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        Err(AudioError::UnsupportedConfig(
            "No F32 input configuration found".to_string(),
        ))
    }
}

fn open_source(source: &CaptureSource) -> Result<Box<dyn FrameSource>, AudioError> {
    match source {
        CaptureSource::File(path) => Ok(Box::new(FileSource::open(path)?)),
        #[cfg(feature = "microphone")]
        CaptureSource::Microphone => Ok(Box::new(microphone::MicrophoneSource::open()?)),
        #[cfg(not(feature = "microphone"))]
        CaptureSource::Microphone => Err(AudioError::MicrophoneUnavailable),
    }
}

// ============================================================================
// CAPTURE SINGLETON
// ============================================================================

/// Anzahl gepufferter Frames pro Session-Track (200ms)
const FRAME_CHANNEL_CAPACITY: usize = 10;

static CAPTURE: OnceCell<CaptureHandle> = OnceCell::new();

/// Prozessweite Capture-Quelle
///
/// Ein Pump-Task liest alle 20ms einen Frame und verteilt ihn per
/// broadcast. Jede Session bekommt über [`CaptureHandle::clone_stream`]
/// einen eigenen Track, damit Mute pro Session wirkt.
#[derive(Clone)]
pub struct CaptureHandle {
    frames: broadcast::Sender<Arc<[f32]>>,
}

impl CaptureHandle {
    /// Öffnet die Quelle und startet den Pump-Task
    fn start(source: &CaptureSource) -> Result<Self, AudioError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| AudioError::NoRuntime)?;
        let frames = open_source(source)?;

        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        runtime.spawn(run_capture_pump(tx.clone(), frames));

        tracing::info!("Audio capture initialized: {:?}", source);
        Ok(Self { frames: tx })
    }

    /// Neuer ausgehender Stream mit eigenem Track, gespeist aus der Quelle
    pub fn clone_stream(&self) -> LocalStream {
        let stream_id = format!("{}-{}", CAPTURE_STREAM_ID, uuid::Uuid::new_v4());
        let track = LocalTrack::new(pcmu_capability(), "pulse-audio", &stream_id);

        tokio::spawn(forward_frames(self.frames.subscribe(), track.clone()));

        LocalStream::new(stream_id, vec![track])
    }

    /// Anzahl der Session-Tracks, die noch Frames empfangen
    pub fn active_streams(&self) -> usize {
        self.frames.receiver_count()
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("streams", &self.active_streams())
            .finish()
    }
}

/// Öffnet die Capture-Quelle beim ersten Aufruf und gibt danach immer
/// dasselbe Handle zurück. Muss innerhalb einer tokio Runtime laufen.
pub fn init_capture(source: &CaptureSource) -> Result<CaptureHandle, AudioError> {
    CAPTURE.get_or_try_init(|| CaptureHandle::start(source)).cloned()
}

/// Liest alle 20ms einen Frame aus der Quelle
async fn run_capture_pump(frames: broadcast::Sender<Arc<[f32]>>, mut source: Box<dyn FrameSource>) {
    let mut interval = tokio::time::interval(FRAME_DURATION);
    let mut frame = vec![0.0f32; FRAME_SIZE];

    loop {
        interval.tick().await;
        // Quelle immer leeren, auch ohne Empfänger, sonst läuft später alter Ton
        source.next_frame(&mut frame);
        let _ = frames.send(Arc::from(frame.as_slice()));
    }
}

/// Schreibt Frames in einen Session-Track; deaktivierte Tracks senden Stille
async fn forward_frames(mut frames: broadcast::Receiver<Arc<[f32]>>, track: LocalTrack) {
    while track.is_live() {
        let frame = match frames.recv().await {
            Ok(frame) => frame,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Track {} skipped {} capture frame(s)", track.id(), skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let payload = if track.is_enabled() {
            encode_frame(&frame)
        } else {
            silence_frame()
        };

        if let Err(e) = write_frame(&track, payload).await {
            tracing::warn!("Failed to write capture frame: {}", e);
        }
    }

    tracing::debug!("Capture forwarding for {} stopped", track.stream_id());
}

// ============================================================================
// TESTS
// ============================================================================
