//! WebRTC Peer Engine
//!
//! [`PeerEngine`]-Implementierung über webrtc-rs. Jede Instanz kapselt genau
//! eine `RTCPeerConnection`; alle Callbacks werden als [`PeerEvent`] an die
//! Session weitergereicht.

use super::media::{InboundTrack, LocalTrack, MediaKind};
use super::peer::{
    IceConnectionState, IceGatheringState, MediaSender, PeerEngine, PeerEngineFactory, PeerError,
    PeerEventKind, PeerEventSink, SdpKind, SessionDescription,
};
use crate::config::IceServerConfig;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_remote::TrackRemote;

/// Ohne RTP-Pakete in diesem Zeitraum gilt ein Remote Track als stumm
const INBOUND_SILENCE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// CONVERSIONS
// ============================================================================

fn webrtc_error(e: webrtc::Error) -> PeerError {
    PeerError::WebRTC(e.to_string())
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    result.map_err(|e| PeerError::InvalidSdp(e.to_string()))
}

fn from_rtc_description(description: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(PeerError::InvalidSdp(format!(
            "unexpected description type {}",
            other
        ))),
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.ufrag,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        ufrag: init.username_fragment,
    }
}

fn map_connection_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn map_gathering_state(state: RTCIceGathererState) -> Option<IceGatheringState> {
    match state {
        RTCIceGathererState::New => Some(IceGatheringState::New),
        RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
        RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
        _ => None,
    }
}

// ============================================================================
// SENDER
// ============================================================================

/// Wrapper um `RTCRtpSender`, merkt sich den aktuell gesendeten Track
struct RtcSender {
    sender: Arc<RTCRtpSender>,
    current: Mutex<Option<LocalTrack>>,
}

#[async_trait]
impl MediaSender for RtcSender {
    async fn track(&self) -> Option<LocalTrack> {
        self.current.lock().clone()
    }

    async fn replace_track(&self, track: Option<LocalTrack>) -> Result<(), PeerError> {
        self.sender
            .replace_track(track.as_ref().map(LocalTrack::as_track_local))
            .await
            .map_err(webrtc_error)?;
        *self.current.lock() = track;
        Ok(())
    }
}

// ============================================================================
// PEER ENGINE
// ============================================================================

/// Peer Engine auf Basis einer webrtc-rs `RTCPeerConnection`
pub struct RtcPeerEngine {
    pc: Arc<RTCPeerConnection>,
    generation: u64,
}

impl RtcPeerEngine {
    /// Erstellt eine neue Peer Connection und registriert alle Handler
    pub async fn new(
        ice_servers: Vec<RTCIceServer>,
        events: PeerEventSink,
    ) -> Result<Self, PeerError> {
        // Media Engine mit Default-Codecs (Opus, PCMU, PCMA, ...)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(webrtc_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_error)?);

        let generation = events.generation();
        Self::setup_handlers(&pc, events);

        tracing::info!("Created peer connection (generation {})", generation);

        Ok(Self { pc, generation })
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(pc: &Arc<RTCPeerConnection>, events: PeerEventSink) {
        // ICE Connection State
        let sink = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            tracing::info!("ICE connection state: {}", s);
            if let Some(state) = map_connection_state(s) {
                sink.emit(PeerEventKind::IceConnectionState(state));
            }
            Box::pin(async {})
        }));

        // ICE Gathering State
        let sink = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |s: RTCIceGathererState| {
            tracing::debug!("ICE gathering state: {}", s);
            if let Some(state) = map_gathering_state(s) {
                sink.emit(PeerEventKind::IceGatheringState(state));
            }
            Box::pin(async {})
        }));

        // ICE Candidates; `None` markiert das Ende des Gatherings, das kommt
        // aber zusätzlich als Gathering State `complete` an
        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        sink.emit(PeerEventKind::IceCandidate(from_rtc_candidate(init)));
                    }
                    Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Remote Tracks
        let sink = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let inbound = InboundTrack::new(
                track.id(),
                track.stream_id(),
                MediaKind::from_codec_type(track.kind()),
            );
            tracing::info!("Received track {} ({:?})", inbound.id(), inbound.kind());
            sink.emit(PeerEventKind::Track(inbound.clone()));
            Box::pin(async move {
                tokio::spawn(watch_inbound_track(track, inbound));
            })
        }));

        let sink = events;
        pc.on_negotiation_needed(Box::new(move || {
            sink.emit(PeerEventKind::NegotiationNeeded);
            Box::pin(async {})
        }));
    }
}

/// Liest RTP vom Remote Track und pflegt dessen `muted`-Flag
async fn watch_inbound_track(track: Arc<TrackRemote>, inbound: InboundTrack) {
    loop {
        match tokio::time::timeout(INBOUND_SILENCE_TIMEOUT, track.read_rtp()).await {
            Ok(Ok(_)) => {
                if inbound.is_muted() {
                    tracing::debug!("Inbound track {} unmuted", inbound.id());
                }
                inbound.set_muted(false);
            }
            Err(_) => {
                if !inbound.is_muted() {
                    tracing::debug!("Inbound track {} muted", inbound.id());
                }
                inbound.set_muted(true);
            }
            Ok(Err(e)) => {
                tracing::debug!("Inbound track {} ended: {}", inbound.id(), e);
                inbound.set_muted(true);
                break;
            }
        }
    }
}

#[async_trait]
impl PeerEngine for RtcPeerEngine {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_error)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(webrtc_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(webrtc_error)?;
        from_rtc_description(answer)
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let description = self.pc.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(webrtc_error)
    }

    async fn add_track(&self, track: LocalTrack) -> Result<Arc<dyn MediaSender>, PeerError> {
        let sender = self
            .pc
            .add_track(track.as_track_local())
            .await
            .map_err(webrtc_error)?;

        // RTCP lesen, sonst laufen die Interceptor-Buffer voll
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(Arc::new(RtcSender {
            sender,
            current: Mutex::new(Some(track)),
        }))
    }

    async fn close(&self) -> Result<(), PeerError> {
        tracing::info!("Closing peer connection (generation {})", self.generation);
        self.pc.close().await.map_err(webrtc_error)
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt für jede Negotiation eine frische [`RtcPeerEngine`]
pub struct RtcPeerEngineFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl RtcPeerEngineFactory {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers.iter().map(IceServerConfig::to_rtc).collect(),
        }
    }
}

#[async_trait]
impl PeerEngineFactory for RtcPeerEngineFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerEngine>, PeerError> {
        let engine = RtcPeerEngine::new(self.ice_servers.clone(), events).await?;
        Ok(Arc::new(engine))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 UDP 2122252543 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            ufrag: Some("abcd".to_string()),
        };

        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.username_fragment.as_deref(), Some("abcd"));
        assert_eq!(from_rtc_candidate(init), candidate);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_connection_state(RTCIceConnectionState::Failed),
            Some(IceConnectionState::Failed)
        );
        assert_eq!(map_connection_state(RTCIceConnectionState::Unspecified), None);
        assert_eq!(
            map_gathering_state(RTCIceGathererState::Complete),
            Some(IceGatheringState::Complete)
        );
    }

    #[test]
    fn test_invalid_sdp_rejected() {
        let result = to_rtc_description(SessionDescription::offer("not sdp"));
        assert!(matches!(result, Err(PeerError::InvalidSdp(_))));
    }

    #[tokio::test]
    async fn test_engine_add_and_replace_track() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let engine = RtcPeerEngine::new(Vec::new(), PeerEventSink::new(7, tx))
            .await
            .unwrap();

        let capability = crate::call_engine::audio::pcmu_capability();
        let mic = LocalTrack::new(capability.clone(), "mic", "pulse");
        let sender = engine.add_track(mic.clone()).await.unwrap();
        assert!(sender.track().await.unwrap().same_track(&mic));

        let tone = LocalTrack::new(capability, "tone", "pulse");
        sender.replace_track(Some(tone.clone())).await.unwrap();
        assert!(sender.track().await.unwrap().same_track(&tone));

        engine.close().await.unwrap();
    }
}
