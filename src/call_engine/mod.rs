//! Call Engine Module - Session Negotiation über WebRTC
//!
//! Dieses Modul verwaltet:
//! - Offer/Answer Negotiation und ICE Candidate Relay
//! - Ausgehende Tracks, Mute und Transmit-Ton
//! - Audio Capture (Mikrofon oder WAV-Datei) als PCMU
//! - Die webrtc-rs Anbindung der Peer Engine

mod audio;
mod engine;
mod media;
mod negotiation;
mod peer;
mod relay;
mod session;
mod tone;
mod tracks;

pub use audio::{
    init_capture, pcmu_capability, AudioError, CaptureHandle, FRAME_DURATION, FRAME_SIZE,
    SAMPLE_RATE,
};
pub use engine::{RtcPeerEngine, RtcPeerEngineFactory};
pub use media::{InboundStream, InboundTrack, LocalStream, LocalTrack, MediaKind};
pub use negotiation::{NegotiationError, NegotiationPhase, SessionState};
pub use peer::{
    IceConnectionState, IceGatheringState, MediaSender, PeerEngine, PeerEngineFactory, PeerError,
    PeerEvent, PeerEventKind, PeerEventSink, SdpKind, SessionDescription,
};
pub use relay::{CandidateDisposition, CandidateError, CandidateRelay};
pub use session::{DisconnectHook, Session};
pub use tone::{SampleToneSource, Tone, ToneSource, ToneSpec, TONE_DURATION, TONE_FREQUENCY_HZ};
pub use tracks::{ToneOutcome, TrackCoordinator};
