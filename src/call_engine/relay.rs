//! Candidate Relay
//!
//! Leitet lokale ICE Candidates an den Signaling-Kanal weiter und wendet
//! Remote Candidates auf die Peer Engine an. Remote Candidates die vor der
//! Remote Description ankommen, werden gepuffert und danach in FIFO-Reihenfolge
//! angewendet.

use super::peer::{PeerEngine, PeerError};
use crate::signaling::{CandidateLocation, IceCandidate, OutboundMessage, SignalingError, SignalingGateway};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CandidateError {
    #[error("Malformed ICE candidate: {0}")]
    Malformed(String),

    #[error("Peer engine rejected candidate: {0}")]
    Rejected(#[from] PeerError),
}

/// Was mit einem Remote Candidate passiert ist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
}

/// Puffer und Weiterleitung für ICE Candidates einer Negotiation
#[derive(Debug, Default)]
pub struct CandidateRelay {
    pending: VecDeque<IceCandidate>,
    remote_description_set: bool,
    end_of_candidates_sent: bool,
    last_local: Option<CandidateLocation>,
}

impl CandidateRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Setzt den Relay für eine neue Negotiation zurück.
    ///
    /// Gepufferte Candidates gehören zum alten Peer Engine Handle und
    /// werden verworfen.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            tracing::debug!("Discarding {} queued remote candidate(s)", self.pending.len());
        }
        self.pending.clear();
        self.remote_description_set = false;
        self.end_of_candidates_sent = false;
        self.last_local = None;
    }

    /// Leitet einen lokal gefundenen Candidate an den Signaling-Kanal weiter
    pub async fn submit_local_candidate(
        &mut self,
        gateway: &dyn SignalingGateway,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        tracing::debug!("Sending local ICE candidate: {}", candidate.candidate);
        self.last_local = Some(candidate.location());

        gateway
            .send(OutboundMessage::IceCandidate(candidate))
            .await
            .inspect_err(|e| tracing::error!("Failed to send ICE candidate: {}", e))
    }

    /// Sendet End-of-Candidates, höchstens einmal pro Negotiation.
    ///
    /// Gibt `true` zurück wenn dieser Aufruf die Nachricht gesendet hat.
    pub async fn notify_gathering_complete(
        &mut self,
        gateway: &dyn SignalingGateway,
    ) -> Result<bool, SignalingError> {
        if self.end_of_candidates_sent {
            return Ok(false);
        }
        self.end_of_candidates_sent = true;

        let location = self.last_local.clone().unwrap_or_default();
        tracing::info!("Local ICE gathering complete");

        gateway
            .send(OutboundMessage::EndOfCandidates(location))
            .await
            .inspect_err(|e| tracing::error!("Failed to send end-of-candidates: {}", e))?;
        Ok(true)
    }

    /// Wendet einen Remote Candidate an oder puffert ihn.
    ///
    /// `peer` ist `None` solange noch kein Handle existiert; dann wird
    /// immer gepuffert.
    pub async fn apply_remote_candidate(
        &mut self,
        peer: Option<&dyn PeerEngine>,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CandidateError> {
        if !candidate.is_well_formed() {
            return Err(CandidateError::Malformed(format!(
                "missing sdpMid and sdpMLineIndex: {}",
                candidate.candidate
            )));
        }

        match peer {
            Some(peer) if self.remote_description_set => {
                Self::apply(peer, candidate).await?;
                Ok(CandidateDisposition::Applied)
            }
            _ => {
                tracing::debug!("Queueing remote candidate until remote description is set");
                self.pending.push_back(candidate);
                Ok(CandidateDisposition::Queued)
            }
        }
    }

    /// Markiert die Remote Description als gesetzt und leert den Puffer.
    ///
    /// Einzelne fehlerhafte Candidates werden geloggt und übersprungen.
    /// Gibt die Anzahl erfolgreich angewendeter Candidates zurück.
    pub async fn remote_description_applied(&mut self, peer: &dyn PeerEngine) -> usize {
        self.remote_description_set = true;

        let mut applied = 0;
        while let Some(candidate) = self.pending.pop_front() {
            match Self::apply(peer, candidate).await {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!("Skipping queued candidate: {}", e),
            }
        }

        if applied > 0 {
            tracing::debug!("Applied {} queued remote candidate(s)", applied);
        }
        applied
    }

    async fn apply(peer: &dyn PeerEngine, candidate: IceCandidate) -> Result<(), CandidateError> {
        if candidate.is_end_of_candidates() {
            tracing::debug!("Applying remote end-of-candidates");
        }
        peer.add_ice_candidate(candidate).await?;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
