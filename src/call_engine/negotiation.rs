//! Negotiation State Machine
//!
//! Führt den Lebenszyklus einer Session: Offer annehmen, Answer erzeugen,
//! ICE-Zustände auswerten und den Media-Ready Request auflösen. Alle
//! Methoden laufen unter dem Negotiation-Lock der Session, zwei Schritte
//! derselben Session überlappen sich also nie.

use super::media::{InboundStream, InboundTrack};
use super::peer::{
    IceConnectionState, PeerEngine, PeerEngineFactory, PeerError, PeerEvent, PeerEventSink,
    SessionDescription,
};
use super::relay::{CandidateError, CandidateRelay};
use super::tracks::TrackCoordinator;
use crate::signaling::{IceCandidate, OutboundMessage, SignalingError, SignalingGateway};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Peer engine error: {0}")]
    Peer(#[from] PeerError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("A media request is already pending")]
    RequestPending,

    #[error("Media request abandoned")]
    Abandoned,

    #[error("Timed out waiting for media-ready")]
    Timeout,
}

// ============================================================================
// SESSION STATE
// ============================================================================

/// Fortschritt innerhalb eines Negotiation-Versuchs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Media Request gesendet, noch kein Offer
    AwaitingOffer,
    RemoteDescriptionSet,
    LocalDescriptionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating(NegotiationPhase),
    Connected,
    /// Altes Handle wird durch ein frisches ersetzt
    Reconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Negotiating(_))
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

pub struct Negotiator {
    factory: Arc<dyn PeerEngineFactory>,
    gateway: Arc<dyn SignalingGateway>,
    tracks: Arc<TrackCoordinator>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: watch::Sender<SessionState>,
    inbound: Arc<RwLock<Option<InboundStream>>>,
    peer: Option<Arc<dyn PeerEngine>>,
    generation: u64,
    relay: CandidateRelay,
    pending_request: Option<(u64, oneshot::Sender<bool>)>,
    next_request_id: u64,
}

impl Negotiator {
    pub fn new(
        factory: Arc<dyn PeerEngineFactory>,
        gateway: Arc<dyn SignalingGateway>,
        tracks: Arc<TrackCoordinator>,
        events: mpsc::UnboundedSender<PeerEvent>,
        state: watch::Sender<SessionState>,
        inbound: Arc<RwLock<Option<InboundStream>>>,
    ) -> Self {
        Self {
            factory,
            gateway,
            tracks,
            events,
            state,
            inbound,
            peer: None,
            generation: 0,
            relay: CandidateRelay::new(),
            pending_request: None,
            next_request_id: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn peer(&self) -> Option<Arc<dyn PeerEngine>> {
        self.peer.clone()
    }

    /// Events von geschlossenen oder ersetzten Handles werden verworfen
    pub fn accepts(&self, event: &PeerEvent) -> bool {
        self.peer.is_some() && event.generation == self.generation
    }

    pub fn pending_candidates(&self) -> usize {
        self.relay.pending_len()
    }

    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!("Session state: {:?} -> {:?}", previous, next);
        }
    }

    // ------------------------------------------------------------------------
    // Offer / Answer
    // ------------------------------------------------------------------------

    /// Beantwortet ein Offer auf einem frischen Peer Engine Handle.
    ///
    /// Schlägt ein Schritt fehl, endet der Versuch in `Failed` und ein
    /// ausstehender Media-Request mit `false`; das nächste Offer startet neu.
    pub async fn handle_offer(&mut self, sdp: String) -> Result<SessionDescription, NegotiationError> {
        match self.negotiate(sdp).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                tracing::error!("Negotiation failed: {}", e);
                self.set_state(SessionState::Failed);
                if let Some((_, tx)) = self.pending_request.take() {
                    let _ = tx.send(false);
                }
                Err(e)
            }
        }
    }

    async fn negotiate(&mut self, sdp: String) -> Result<SessionDescription, NegotiationError> {
        let peer = self.fresh_peer().await?;

        peer.set_remote_description(SessionDescription::offer(sdp)).await?;
        self.set_state(SessionState::Negotiating(NegotiationPhase::RemoteDescriptionSet));
        self.relay.remote_description_applied(peer.as_ref()).await;

        self.tracks.bind_outbound_tracks(peer.as_ref()).await?;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer).await?;
        self.set_state(SessionState::Negotiating(NegotiationPhase::LocalDescriptionSet));

        // Die Local Description kann vom erzeugten Answer abweichen
        let local = peer
            .local_description()
            .await
            .ok_or_else(|| PeerError::WebRTC("no local description after answer".to_string()))?;

        tracing::info!("Sending media answer");
        self.gateway
            .send(OutboundMessage::MediaAnswer {
                sdp: local.sdp.clone(),
            })
            .await?;
        Ok(local)
    }

    /// Schließt ein vorhandenes Handle und erzeugt ein neues.
    ///
    /// Gepufferte Candidates eines alten Handles werden verworfen; solche
    /// ohne jedes Handle gehören zum ersten Offer und bleiben erhalten.
    async fn fresh_peer(&mut self) -> Result<Arc<dyn PeerEngine>, NegotiationError> {
        if let Some(old) = self.peer.take() {
            tracing::info!("Replacing peer engine (generation {})", self.generation);
            if self.state() == SessionState::Connected {
                self.set_state(SessionState::Reconnecting);
            }
            if let Err(e) = old.close().await {
                tracing::warn!("Failed to close previous peer engine: {}", e);
            }
            self.relay.reset();
            self.tracks.unbind();
            self.inbound.write().take();
        }

        self.generation += 1;
        let sink = PeerEventSink::new(self.generation, self.events.clone());
        let peer = self.factory.create(sink).await?;
        self.peer = Some(Arc::clone(&peer));
        tracing::debug!("Created peer engine (generation {})", self.generation);
        Ok(peer)
    }

    // ------------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------------

    pub async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        // Nach dem Teardown gehören Candidates zur beendeten Verbindung
        if self.peer.is_none() && self.state() == SessionState::Disconnected {
            tracing::debug!("Dropping remote candidate after disconnect");
            return;
        }

        match self
            .relay
            .apply_remote_candidate(self.peer.as_deref(), candidate)
            .await
        {
            Ok(disposition) => tracing::debug!("Remote candidate {:?}", disposition),
            Err(CandidateError::Malformed(reason)) => {
                tracing::warn!("Dropping malformed candidate: {}", reason)
            }
            Err(e) => tracing::warn!("Skipping remote candidate: {}", e),
        }
    }

    pub async fn handle_local_candidate(&mut self, candidate: IceCandidate) {
        // Fehler sind im Relay bereits geloggt
        let _ = self
            .relay
            .submit_local_candidate(self.gateway.as_ref(), candidate)
            .await;
    }

    pub async fn handle_gathering_complete(&mut self) {
        let _ = self
            .relay
            .notify_gathering_complete(self.gateway.as_ref())
            .await;
    }

    // ------------------------------------------------------------------------
    // Engine callbacks
    // ------------------------------------------------------------------------

    /// Gibt `true` zurück wenn der Zustand einen Teardown ausgelöst hat
    pub async fn handle_ice_state(&mut self, ice: IceConnectionState) -> bool {
        tracing::debug!("ICE connection state: {:?}", ice);
        match ice {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                if self.state().is_negotiating() {
                    self.set_state(SessionState::Connected);
                }
                false
            }
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                tracing::warn!("ICE connection lost ({:?})", ice);
                self.teardown().await
            }
            _ => false,
        }
    }

    pub fn handle_track(&mut self, track: InboundTrack) {
        tracing::info!("Remote track received: {} ({:?})", track.id(), track.kind());
        let mut inbound = self.inbound.write();
        match inbound.as_mut() {
            Some(stream) => {
                stream.add_track(track);
            }
            None => *inbound = Some(InboundStream::new(track)),
        }
    }

    // ------------------------------------------------------------------------
    // Media request
    // ------------------------------------------------------------------------

    /// Legt den einzigen ausstehenden Media Request an
    pub fn begin_request(&mut self) -> Result<(u64, oneshot::Receiver<bool>), NegotiationError> {
        if self
            .pending_request
            .as_ref()
            .is_some_and(|(_, tx)| !tx.is_closed())
        {
            return Err(NegotiationError::RequestPending);
        }

        self.next_request_id += 1;
        let (tx, rx) = oneshot::channel();
        self.pending_request = Some((self.next_request_id, tx));

        if self.state() == SessionState::Idle {
            self.set_state(SessionState::Negotiating(NegotiationPhase::AwaitingOffer));
        }
        Ok((self.next_request_id, rx))
    }

    /// Verwirft den Request `id`, falls er noch aussteht
    pub fn clear_request(&mut self, id: u64) {
        if self.pending_request.as_ref().is_some_and(|(pending, _)| *pending == id) {
            self.pending_request = None;
            if self.peer.is_none()
                && self.state() == SessionState::Negotiating(NegotiationPhase::AwaitingOffer)
            {
                self.set_state(SessionState::Idle);
            }
        }
    }

    /// Löst den ausstehenden Request auf; ohne Request passiert nichts
    pub fn resolve_media_ready(&mut self) -> bool {
        match self.pending_request.take() {
            Some((_, tx)) => {
                tracing::info!("Media ready");
                tx.send(true).is_ok()
            }
            None => {
                tracing::debug!("Media ready without pending request");
                false
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Schließt das Handle und wechselt nach `Disconnected`.
    ///
    /// Gibt nur beim ersten Übergang `true` zurück.
    pub async fn teardown(&mut self) -> bool {
        if self.state() == SessionState::Disconnected {
            return false;
        }

        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Failed to close peer engine: {}", e);
            }
        }
        self.relay.reset();
        self.tracks.unbind();
        self.inbound.write().take();
        if let Some((_, tx)) = self.pending_request.take() {
            let _ = tx.send(false);
        }

        self.set_state(SessionState::Disconnected);
        true
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("state", &self.state())
            .field("generation", &self.generation)
            .field("has_peer", &self.peer.is_some())
            .field("relay", &self.relay)
            .field("request_pending", &self.pending_request.is_some())
            .finish()
    }
}
