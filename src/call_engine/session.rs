//! Session Facade
//!
//! Verbindet Signaling, Negotiation und Tracks zu einer Session. Signaling
//! Nachrichten und Peer Engine Events laufen über Channels in eine einzige
//! Event-Schleife und werden dort nacheinander abgearbeitet.

use super::media::{InboundStream, LocalStream};
use super::negotiation::{NegotiationError, Negotiator, SessionState};
use super::peer::{IceGatheringState, PeerEngineFactory, PeerEvent, PeerEventKind};
use super::tone::ToneSource;
use super::tracks::TrackCoordinator;
use crate::config::SessionConfig;
use crate::signaling::{
    IceCandidate, InboundEnvelope, OutboundMessage, SignalingGateway, SignalingMessage,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Wird beim Übergang nach `Disconnected` aufgerufen
pub type DisconnectHook = Arc<dyn Fn() + Send + Sync>;

enum Step {
    Signaling(InboundEnvelope),
    Peer(PeerEvent),
}

pub struct Session {
    config: SessionConfig,
    gateway: Arc<dyn SignalingGateway>,
    negotiator: tokio::sync::Mutex<Negotiator>,
    tracks: Arc<TrackCoordinator>,
    state: watch::Receiver<SessionState>,
    inbound: Arc<RwLock<Option<InboundStream>>>,
    disconnect_hook: RwLock<Option<DisconnectHook>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl Session {
    /// Erstellt eine Session.
    ///
    /// `outbound` ist der Stream dieser Session, typischerweise ein Klon
    /// des Capture-Streams (siehe [`crate::call_engine::init_capture`]).
    pub fn new(
        config: SessionConfig,
        gateway: Arc<dyn SignalingGateway>,
        factory: Arc<dyn PeerEngineFactory>,
        outbound: LocalStream,
        tone_source: Arc<dyn ToneSource>,
    ) -> Arc<Self> {
        let tracks = Arc::new(TrackCoordinator::new(
            outbound,
            config.tone_enabled,
            tone_source,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let inbound = Arc::new(RwLock::new(None));

        let negotiator = Negotiator::new(
            factory,
            Arc::clone(&gateway),
            Arc::clone(&tracks),
            events_tx,
            state_tx,
            Arc::clone(&inbound),
        );

        Arc::new(Self {
            config,
            gateway,
            negotiator: tokio::sync::Mutex::new(negotiator),
            tracks,
            state: state_rx,
            inbound,
            disconnect_hook: RwLock::new(None),
            events: Mutex::new(Some(events_rx)),
        })
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    /// Startet die Event-Schleife der Session.
    ///
    /// Endet wenn der Signaling-Kanal geschlossen oder die Session
    /// freigegeben wird. Kann nur einmal gestartet werden.
    pub fn start(self: &Arc<Self>, mut signaling: broadcast::Receiver<InboundEnvelope>) -> JoinHandle<()> {
        let Some(mut events) = self.events.lock().take() else {
            tracing::warn!("Session event loop already started");
            return tokio::spawn(async {});
        };

        let session = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let step = tokio::select! {
                    message = signaling.recv() => match message {
                        Ok(envelope) => Step::Signaling(envelope),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Session lagged behind signaling by {} message(s)", n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::info!("Signaling channel closed");
                            break;
                        }
                    },
                    Some(event) = events.recv() => Step::Peer(event),
                };

                let Some(session) = session.upgrade() else {
                    tracing::debug!("Session dropped, stopping event loop");
                    break;
                };
                match step {
                    Step::Signaling(envelope) => session.handle_signaling(envelope).await,
                    Step::Peer(event) => session.handle_peer_event(event).await,
                }
            }
        })
    }

    /// Verarbeitet eine Signaling-Nachricht
    pub async fn handle_signaling(&self, envelope: InboundEnvelope) {
        let kind = envelope.message.kind();
        if !envelope.is_remote() {
            tracing::debug!("Ignoring locally echoed {:?}", kind);
            return;
        }
        tracing::debug!("Signaling message: {:?}", kind);

        let mut negotiator = self.negotiator.lock().await;
        match envelope.message {
            SignalingMessage::Offer { sdp } => {
                // Fehler sind geloggt, die Session bleibt für das nächste Offer bereit
                let _ = negotiator.handle_offer(sdp).await;
            }
            SignalingMessage::Answer { .. } => {
                tracing::warn!("Ignoring unexpected answer, this side only answers offers");
            }
            SignalingMessage::IceCandidate(candidate) => {
                negotiator.handle_remote_candidate(candidate).await;
            }
            SignalingMessage::EndOfCandidates(location) => {
                negotiator
                    .handle_remote_candidate(IceCandidate::end_of_candidates(location))
                    .await;
            }
            SignalingMessage::MediaReady => {
                negotiator.resolve_media_ready();
            }
        }
    }

    /// Verarbeitet ein Callback der Peer Engine
    pub async fn handle_peer_event(&self, event: PeerEvent) {
        let torn_down = {
            let mut negotiator = self.negotiator.lock().await;
            if !negotiator.accepts(&event) {
                tracing::debug!(
                    "Ignoring event from stale peer engine (generation {})",
                    event.generation
                );
                return;
            }

            match event.kind {
                PeerEventKind::IceCandidate(candidate) => {
                    negotiator.handle_local_candidate(candidate).await;
                    false
                }
                PeerEventKind::IceGatheringState(IceGatheringState::Complete) => {
                    negotiator.handle_gathering_complete().await;
                    false
                }
                PeerEventKind::IceGatheringState(state) => {
                    tracing::debug!("ICE gathering state: {:?}", state);
                    false
                }
                PeerEventKind::IceConnectionState(state) => negotiator.handle_ice_state(state).await,
                PeerEventKind::Track(track) => {
                    negotiator.handle_track(track);
                    false
                }
                PeerEventKind::NegotiationNeeded => {
                    tracing::debug!("Peer engine requested renegotiation");
                    false
                }
            }
        };

        if torn_down {
            self.fire_disconnect_hook();
        }
    }

    // ========================================================================
    // MEDIA REQUEST
    // ========================================================================

    /// Fordert eine Media-Verbindung an und wartet auf Media-Ready.
    ///
    /// Läuft bereits ein Request, schlägt der Aufruf sofort fehl.
    pub async fn init_media_connection(&self) -> bool {
        match self.request_media().await {
            Ok(()) => true,
            Err(NegotiationError::RequestPending) => {
                tracing::warn!("Media connection already requested");
                false
            }
            Err(e) => {
                tracing::error!("Media connection failed: {}", e);
                false
            }
        }
    }

    async fn request_media(&self) -> Result<(), NegotiationError> {
        let (id, ready) = self.negotiator.lock().await.begin_request()?;

        tracing::info!("Requesting media connection");
        if let Err(e) = self.gateway.send(OutboundMessage::RequestMediaConnection).await {
            self.negotiator.lock().await.clear_request(id);
            return Err(e.into());
        }

        let ready = match self.config.media_ready_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, ready).await {
                Ok(ready) => ready,
                Err(_) => {
                    self.negotiator.lock().await.clear_request(id);
                    return Err(NegotiationError::Timeout);
                }
            },
            None => ready.await,
        };

        match ready {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(NegotiationError::Abandoned),
        }
    }

    // ========================================================================
    // MUTE
    // ========================================================================

    /// Schaltet das ausgehende Audio stumm oder laut
    pub fn set_mute(&self, muted: bool) {
        self.tracks.set_mute(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.tracks.is_muted()
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Es kommt tatsächlich Audio an: ein Remote-Track ist nicht stumm
    pub fn stable_connection(&self) -> bool {
        self.inbound
            .read()
            .as_ref()
            .is_some_and(InboundStream::has_unmuted_track)
    }

    pub fn inbound_stream(&self) -> Option<InboundStream> {
        self.inbound.read().clone()
    }

    pub fn outbound_stream(&self) -> &LocalStream {
        self.tracks.outbound()
    }

    pub fn tracks(&self) -> &Arc<TrackCoordinator> {
        &self.tracks
    }

    // ========================================================================
    // DISCONNECT
    // ========================================================================

    /// Beendet die Session. Mehrfache Aufrufe sind harmlos, der Hook läuft
    /// nur beim ersten.
    pub async fn disconnect(&self) {
        let torn_down = self.negotiator.lock().await.teardown().await;
        if torn_down {
            tracing::info!("Session disconnected");
            self.fire_disconnect_hook();
        }
    }

    /// Registriert den Disconnect-Hook; ein neuer ersetzt den alten
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.disconnect_hook.write() = Some(Arc::new(hook));
    }

    fn fire_disconnect_hook(&self) {
        let hook = self.disconnect_hook.read().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("tracks", &self.tracks)
            .field("stable_connection", &self.stable_connection())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
