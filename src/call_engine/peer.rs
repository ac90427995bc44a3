//! Peer Engine Schnittstelle
//!
//! Die Session spricht die native Peer Connection nur über diese Traits an.
//! Callbacks der Engine kommen als [`PeerEvent`] über einen Channel zurück
//! und tragen die Generation des Handles, von dem sie stammen.

use super::media::{InboundTrack, LocalTrack};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer engine closed")]
    Closed,
}

// ============================================================================
// DESCRIPTIONS & STATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone)]
pub enum PeerEventKind {
    /// Lokal gefundener Candidate
    IceCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    IceGatheringState(IceGatheringState),
    /// Remote Track empfangen
    Track(InboundTrack),
    NegotiationNeeded,
}

#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Sendeseite für Engine-Callbacks, fest an eine Generation gebunden
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Gibt `false` zurück wenn die Session nicht mehr zuhört
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

// ============================================================================
// TRAITS
// ============================================================================

/// Ein Sender der Peer Engine (RTCRtpSender)
#[async_trait]
pub trait MediaSender: Send + Sync {
    /// Aktuell gesendeter Track
    async fn track(&self) -> Option<LocalTrack>;

    /// Tauscht den gesendeten Track ohne Neuverhandlung aus
    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), PeerError>;
}

/// Negotiation-Primitive der nativen Peer Connection
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;

    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn MediaSender>, PeerError>;

    async fn close(&self) -> Result<(), PeerError>;
}

/// Erzeugt frische Peer Engine Handles
#[async_trait]
pub trait PeerEngineFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerEngine>, PeerError>;
}
