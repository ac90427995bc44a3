//! Track- und Stream-Handles
//!
//! Ausgehende Tracks sind `TrackLocalStaticSample`s aus webrtc-rs, ergänzt
//! um die Zustände die der Browser an einem MediaStreamTrack führt
//! (`enabled`, `readyState`). Eingehende Tracks werden nur als Handle
//! geführt; Wiedergabe ist nicht Teil dieses Crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(Self::Audio),
            RTPCodecType::Video => Some(Self::Video),
            _ => None,
        }
    }
}

// ============================================================================
// OUTBOUND
// ============================================================================

/// Ausgehender Track
///
/// Klone teilen sich denselben webrtc-Track und dieselben Flags.
#[derive(Clone)]
pub struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(codec: RTCRtpCodecCapability, id: &str, stream_id: &str) -> Self {
        Self {
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                stream_id.to_string(),
            )),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_codec_type(self.track.kind())
    }

    pub fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec()
    }

    /// Deaktivierte Tracks senden Stille statt Capture-Daten
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Beendet den Track endgültig (readyState "ended")
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }

    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    /// Zwei Handles zeigen auf denselben webrtc-Track
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.track, &other.track)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Geordnete Menge ausgehender Tracks
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks
            .iter()
            .filter(|t| t.kind() == Some(MediaKind::Audio))
    }
}

// ============================================================================
// INBOUND
// ============================================================================

/// Eingehender Track
///
/// `muted` wird von der Peer Engine gepflegt: ein Track gilt als stumm,
/// solange keine RTP-Pakete ankommen.
#[derive(Debug, Clone)]
pub struct InboundTrack {
    id: String,
    stream_id: String,
    kind: Option<MediaKind>,
    muted: Arc<AtomicBool>,
}

impl InboundTrack {
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: Option<MediaKind>) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> Option<MediaKind> {
        self.kind
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

/// Eingehender Stream der Gegenseite
#[derive(Debug, Clone)]
pub struct InboundStream {
    id: String,
    tracks: Vec<InboundTrack>,
}

impl InboundStream {
    pub fn new(first: InboundTrack) -> Self {
        Self {
            id: first.stream_id.clone(),
            tracks: vec![first],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[InboundTrack] {
        &self.tracks
    }

    /// Fügt einen weiteren Track hinzu; doppelte Track-IDs werden ignoriert
    pub fn add_track(&mut self, track: InboundTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn has_unmuted_track(&self) -> bool {
        self.tracks.iter().any(|t| !t.is_muted())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_engine::audio::pcmu_capability;

    #[test]
    fn test_local_track_clone_shares_state() {
        let track = LocalTrack::new(pcmu_capability(), "mic", "pulse");
        let clone = track.clone();

        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&clone));
        assert_eq!(track.kind(), Some(MediaKind::Audio));
    }

    #[test]
    fn test_inbound_stream_unmuted() {
        let first = InboundTrack::new("a", "remote", Some(MediaKind::Audio));
        let mut stream = InboundStream::new(first.clone());
        assert!(stream.has_unmuted_track());

        first.set_muted(true);
        assert!(!stream.has_unmuted_track());

        let second = InboundTrack::new("b", "remote", Some(MediaKind::Audio));
        assert!(stream.add_track(second));
        assert!(!stream.add_track(InboundTrack::new("b", "remote", None)));
        assert!(stream.has_unmuted_track());
    }
}
