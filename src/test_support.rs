//! Test-Doubles für Peer Engine, Signaling und Ton-Synthese

use crate::call_engine::{
    pcmu_capability, AudioError, LocalTrack, MediaSender, PeerEngine, PeerEngineFactory,
    PeerError, PeerEventSink, SdpKind, SessionDescription, Tone, ToneSource, ToneSpec,
};
use crate::signaling::{IceCandidate, OutboundMessage, SignalingError, SignalingGateway};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

pub fn candidate(i: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{i} 1 UDP 2122252543 192.168.1.{i} 5000{i} typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        ufrag: Some("pulse".to_string()),
    }
}

pub fn audio_track(id: &str) -> LocalTrack {
    LocalTrack::new(pcmu_capability(), id, "pulse")
}

pub fn video_track(id: &str) -> LocalTrack {
    let vp8 = RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        ..Default::default()
    };
    LocalTrack::new(vp8, id, "pulse")
}

// ============================================================================
// PEER ENGINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    SetRemoteDescription(SessionDescription),
    SetLocalDescription(SessionDescription),
    CreateAnswer,
    AddIceCandidate(IceCandidate),
    AddTrack(String),
    Close,
}

#[derive(Default)]
pub struct MockPeerEngine {
    calls: Mutex<Vec<PeerCall>>,
    applied: Mutex<Vec<IceCandidate>>,
    rejected: Mutex<HashSet<String>>,
    tracks: Mutex<Vec<LocalTrack>>,
    local: Mutex<Option<SessionDescription>>,
    fail_remote: AtomicBool,
    closed: AtomicBool,
}

impl MockPeerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.applied.lock().clone()
    }

    pub fn reject_candidate(&self, candidate: &str) {
        self.rejected.lock().insert(candidate.to_string());
    }

    pub fn fail_remote_description(&self) {
        self.fail_remote.store(true, Ordering::SeqCst);
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id().to_string()).collect()
    }

    pub fn current_local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, call: PeerCall) -> Result<(), PeerError> {
        self.calls.lock().push(call);
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerEngine for MockPeerEngine {
    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemoteDescription(description))?;
        if self.fail_remote.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidSdp("scripted failure".to_string()));
        }
        Ok(())
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocalDescription(description.clone()))?;
        *self.local.lock() = Some(description);
        Ok(())
    }

    /// Das Answer listet jeden hinzugefügten Track als `a=msid` Zeile
    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateAnswer)?;
        let mut sdp = String::from("v=0\r\n");
        for track in self.tracks.lock().iter() {
            sdp.push_str(&format!("a=msid:{} {}\r\n", track.stream_id(), track.id()));
        }
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp,
        })
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.current_local_description()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(PeerCall::AddIceCandidate(candidate.clone()))?;
        if self.rejected.lock().contains(&candidate.candidate) {
            return Err(PeerError::WebRTC("scripted rejection".to_string()));
        }
        self.applied.lock().push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn MediaSender>, PeerError> {
        self.record(PeerCall::AddTrack(track.id().to_string()))?;
        self.tracks.lock().push(track.clone());
        Ok(Arc::new(MockSender::new(Some(track))))
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.calls.lock().push(PeerCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSender {
    track: Mutex<Option<LocalTrack>>,
    replaced: Mutex<Vec<Option<String>>>,
    fail_next: AtomicBool,
}

impl MockSender {
    pub fn new(track: Option<LocalTrack>) -> Self {
        Self {
            track: Mutex::new(track),
            ..Default::default()
        }
    }

    /// Track-IDs aller `replace_track` Aufrufe
    pub fn replacements(&self) -> Vec<Option<String>> {
        self.replaced.lock().clone()
    }

    pub fn current_track_id(&self) -> Option<String> {
        self.track.lock().as_ref().map(|t| t.id().to_string())
    }

    /// Der nächste Tausch wird ausgeführt, meldet aber einen Fehler
    pub fn fail_next_replace(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSender for MockSender {
    async fn track(&self) -> Option<LocalTrack> {
        self.track.lock().clone()
    }

    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), PeerError> {
        self.replaced
            .lock()
            .push(track.as_ref().map(|t| t.id().to_string()));
        *self.track.lock() = track;

        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PeerError::WebRTC("scripted replace failure".to_string()));
        }
        Ok(())
    }
}

/// Liefert vorbereitete oder frische [`MockPeerEngine`]s und merkt sich
/// die Event-Sinks, damit Tests Engine-Callbacks auslösen können.
#[derive(Default)]
pub struct MockFactory {
    scripted: Mutex<VecDeque<Arc<MockPeerEngine>>>,
    created: Mutex<Vec<(Arc<MockPeerEngine>, PeerEventSink)>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_engine(&self, engine: Arc<MockPeerEngine>) {
        self.scripted.lock().push_back(engine);
    }

    pub fn created(&self) -> usize {
        self.created.lock().len()
    }

    pub fn engine(&self, index: usize) -> Arc<MockPeerEngine> {
        Arc::clone(&self.created.lock()[index].0)
    }

    pub fn sink(&self, index: usize) -> PeerEventSink {
        self.created.lock()[index].1.clone()
    }
}

#[async_trait]
impl PeerEngineFactory for MockFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerEngine>, PeerError> {
        let engine = self
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| Arc::new(MockPeerEngine::new()));
        self.created.lock().push((Arc::clone(&engine), events));
        Ok(engine)
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

#[derive(Default)]
pub struct MockGateway {
    sent: Mutex<Vec<OutboundMessage>>,
    fail: AtomicBool,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingGateway for MockGateway {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::SendFailed("scripted failure".to_string()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

// ============================================================================
// TONE
// ============================================================================

/// Erzeugt stille Ton-Tracks ohne Frames
#[derive(Default)]
pub struct MockToneSource {
    synthesized: AtomicUsize,
    fail: AtomicBool,
}

impl MockToneSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn synthesized(&self) -> usize {
        self.synthesized.load(Ordering::SeqCst)
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToneSource for MockToneSource {
    async fn synthesize(&self, _spec: &ToneSpec, template: &LocalTrack) -> Result<Tone, AudioError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AudioError::UnsupportedConfig("scripted failure".to_string()));
        }
        let n = self.synthesized.fetch_add(1, Ordering::SeqCst);
        let track = LocalTrack::new(template.codec(), &format!("tone-{n}"), template.stream_id());
        Ok(Tone::new(track, Vec::new()))
    }
}
