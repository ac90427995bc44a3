//! Message Types für das Signaling-Protokoll
//!
//! Eingehende Nachrichten kommen als JSON-Envelope mit `type`-Tag und
//! einem `origin`-Feld. Nur Nachrichten mit `origin = "remote"` werden von
//! der Session verarbeitet; lokal geechote Nachrichten werden verworfen.

use serde::{Deserialize, Serialize};

// ============================================================================
// SHARED TYPES
// ============================================================================

/// Ein ICE Candidate wie er über den Signaling-Kanal transportiert wird.
///
/// Ein leerer `candidate`-String ist ein End-of-Candidates Marker der
/// Gegenseite und wird wie ein normaler Candidate angewendet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "ufrag", default, skip_serializing_if = "Option::is_none")]
    pub ufrag: Option<String>,
}

impl IceCandidate {
    /// Erstellt den End-of-Candidates Marker für eine Media-Section
    pub fn end_of_candidates(location: CandidateLocation) -> Self {
        Self {
            candidate: String::new(),
            sdp_mid: location.sdp_mid,
            sdp_mline_index: location.sdp_mline_index,
            ufrag: location.ufrag,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.is_empty()
    }

    /// Ohne `sdpMid` und ohne `sdpMLineIndex` kann die Peer Engine den
    /// Candidate keiner Media-Section zuordnen.
    pub fn is_well_formed(&self) -> bool {
        self.is_end_of_candidates() || self.sdp_mid.is_some() || self.sdp_mline_index.is_some()
    }

    pub fn location(&self) -> CandidateLocation {
        CandidateLocation {
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            ufrag: self.ufrag.clone(),
        }
    }
}

/// Media-Section und ICE-Generation auf die sich ein Candidate bezieht
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLocation {
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "ufrag", default, skip_serializing_if = "Option::is_none")]
    pub ufrag: Option<String>,
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Herkunft einer eingehenden Nachricht
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Von der Gegenseite bzw. vom Server
    #[default]
    Remote,
    /// Vom eigenen Client erzeugt und zurückgespiegelt
    Local,
}

/// Alle Nachrichten die die Session vom Signaling-Kanal empfängt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// SDP Offer vom Server
    Offer { sdp: String },

    /// SDP Answer (wird nie empfangen, nur lokal erzeugt)
    Answer { sdp: String },

    /// Remote ICE Candidate
    IceCandidate(IceCandidate),

    /// Die Gegenseite hat alle Candidates gesendet
    EndOfCandidates(CandidateLocation),

    /// Der Server bestätigt, dass Media fließt
    MediaReady,
}

impl SignalingMessage {
    /// Schlüssel für die Dispatch-Tabelle der Session
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Offer { .. } => MessageKind::Offer,
            Self::Answer { .. } => MessageKind::Answer,
            Self::IceCandidate(_) => MessageKind::IceCandidate,
            Self::EndOfCandidates(_) => MessageKind::EndOfCandidates,
            Self::MediaReady => MessageKind::MediaReady,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Offer,
    Answer,
    IceCandidate,
    EndOfCandidates,
    MediaReady,
}

/// Eingehende Nachricht samt Herkunfts-Flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub origin: Origin,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl InboundEnvelope {
    pub fn remote(message: SignalingMessage) -> Self {
        Self {
            origin: Origin::Remote,
            message,
        }
    }

    pub fn local(message: SignalingMessage) -> Self {
        Self {
            origin: Origin::Local,
            message,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin == Origin::Remote
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten die die Session über den Signaling-Kanal sendet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Bittet den Server um ein frisches Offer
    RequestMediaConnection,

    /// Lokal gefundener ICE Candidate
    IceCandidate(IceCandidate),

    /// Lokales ICE Gathering ist abgeschlossen
    EndOfCandidates(CandidateLocation),

    /// SDP Answer auf das Offer des Servers
    MediaAnswer { sdp: String },
}

// ============================================================================
// TESTS
// ============================================================================
