//! Transmit-Ton
//!
//! Ein kurzer Sinuston, der beim Unmute statt des Mikrofons gesendet wird.
//! [`ToneSource`] erzeugt einen frischen Track mit vorgerendertem Ton;
//! abgespielt wird er erst nach [`Tone::start`], also nachdem der Sender
//! auf den Ton-Track umgeschaltet wurde.

use super::audio::{self, AudioError, FRAME_DURATION, FRAME_SIZE, SAMPLE_RATE};
use super::media::LocalTrack;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::api::media_engine::MIME_TYPE_PCMU;

pub const TONE_FREQUENCY_HZ: f32 = 1969.0;
pub const TONE_DURATION: Duration = Duration::from_millis(250);
const TONE_GAIN: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneSpec {
    pub frequency_hz: f32,
    pub duration: Duration,
    pub gain: f32,
}

impl Default for ToneSpec {
    fn default() -> Self {
        Self {
            frequency_hz: TONE_FREQUENCY_HZ,
            duration: TONE_DURATION,
            gain: TONE_GAIN,
        }
    }
}

/// Ein synthetisierter Ton samt Track
pub struct Tone {
    track: LocalTrack,
    frames: Vec<Bytes>,
    player: Option<JoinHandle<()>>,
}

impl Tone {
    pub fn new(track: LocalTrack, frames: Vec<Bytes>) -> Self {
        Self {
            track,
            frames,
            player: None,
        }
    }

    pub fn track(&self) -> &LocalTrack {
        &self.track
    }

    /// Startet das Schreiben der Frames in den Track
    pub fn start(&mut self) {
        if self.player.is_some() || self.frames.is_empty() {
            return;
        }

        let track = self.track.clone();
        let frames = std::mem::take(&mut self.frames);
        self.player = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(FRAME_DURATION);
            for frame in frames {
                interval.tick().await;
                if !track.is_live() {
                    break;
                }
                if let Err(e) = audio::write_frame(&track, frame).await {
                    tracing::warn!("Failed to write tone frame: {}", e);
                    break;
                }
            }
        }));
    }

    /// Gibt die Synthese-Ressourcen frei; der Track ist danach beendet
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Tone {
    fn drop(&mut self) {
        if let Some(player) = self.player.take() {
            player.abort();
        }
        self.track.stop();
    }
}

impl std::fmt::Debug for Tone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tone")
            .field("track", &self.track)
            .field("frames", &self.frames.len())
            .field("playing", &self.player.is_some())
            .finish()
    }
}

/// Audio-Graph der einen Ton-Track erzeugen kann
#[async_trait]
pub trait ToneSource: Send + Sync {
    /// `template` ist der aktuell gesendete Track; der Ton übernimmt dessen
    /// Codec und Stream-ID, damit `replace_track` ohne Neuverhandlung geht.
    async fn synthesize(&self, spec: &ToneSpec, template: &LocalTrack) -> Result<Tone, AudioError>;
}

/// Sinuston als PCMU-Samples
#[derive(Debug, Default)]
pub struct SampleToneSource;

#[async_trait]
impl ToneSource for SampleToneSource {
    async fn synthesize(&self, spec: &ToneSpec, template: &LocalTrack) -> Result<Tone, AudioError> {
        let codec = template.codec();
        if !codec.mime_type.eq_ignore_ascii_case(MIME_TYPE_PCMU) {
            return Err(AudioError::UnsupportedConfig(format!(
                "tone needs {} but the sender uses {}",
                MIME_TYPE_PCMU, codec.mime_type
            )));
        }

        let samples = sine_wave(spec, SAMPLE_RATE);
        let frames = samples
            .chunks(FRAME_SIZE)
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(FRAME_SIZE, 0.0);
                audio::encode_frame(&frame)
            })
            .collect();

        let id = format!("tone-{}", uuid::Uuid::new_v4());
        let track = LocalTrack::new(codec, &id, template.stream_id());
        Ok(Tone::new(track, frames))
    }
}

/// Rendert einen Sinuston mit kurzen Rampen gegen Knackser
pub fn sine_wave(spec: &ToneSpec, sample_rate: u32) -> Vec<f32> {
    let total = (spec.duration.as_secs_f32() * sample_rate as f32).round() as usize;
    let ramp = (sample_rate as usize / 200).min(total / 2).max(1);
    let step = 2.0 * std::f32::consts::PI * spec.frequency_hz / sample_rate as f32;

    (0..total)
        .map(|i| {
            let envelope = (i.min(total - 1 - i) as f32 / ramp as f32).min(1.0);
            (i as f32 * step).sin() * spec.gain * envelope
        })
        .collect()
}
