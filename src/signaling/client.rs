//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung:
//! - Read-Task dekodiert eingehende Envelopes und verteilt sie per broadcast
//! - Write-Task leert eine mpsc-Queue in den Socket
//! - Implementiert [`SignalingGateway`] für die Session

use super::messages::*;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to decode message: {0}")]
    DecodeFailed(String),
}

// ============================================================================
// GATEWAY TRAIT
// ============================================================================

/// Sendeseite des Signaling-Kanals, so wie die Session sie sieht.
///
/// Empfangen läuft getrennt über einen typisierten Channel von
/// [`InboundEnvelope`]s, siehe [`SignalingClient::subscribe`].
#[async_trait]
pub trait SignalingGateway: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: url::Url,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
    event_tx: broadcast::Sender<InboundEnvelope>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(server_url: &str) -> Result<Self, SignalingError> {
        let server_url = url::Url::parse(server_url)
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;
        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            server_url,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        })
    }

    /// Gibt einen Receiver für eingehende Nachrichten zurück
    pub fn subscribe(&self) -> broadcast::Receiver<InboundEnvelope> {
        self.event_tx.subscribe()
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Signaling-Server
    pub async fn connect(&mut self) -> Result<(), SignalingError> {
        let ws_url = Self::websocket_url(&self.server_url);

        tracing::info!("Connecting to signaling server: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        self.tx = Some(tx);
        self.state.write().is_connected = true;

        // Read-Task
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match Self::decode(&text) {
                        Ok(envelope) => {
                            tracing::debug!("Signaling message: {:?}", envelope.message.kind());
                            let _ = event_tx.send(envelope);
                        }
                        Err(e) => tracing::warn!("Dropping signaling message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(())
    }

    /// http(s) URLs werden auf ws(s) umgeschrieben
    fn websocket_url(server_url: &url::Url) -> url::Url {
        let mut ws_url = server_url.clone();
        let scheme = match server_url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            // http→ws und https→wss sind laut url-Crate immer erlaubt
            let _ = ws_url.set_scheme(scheme);
        }
        ws_url
    }

    fn decode(text: &str) -> Result<InboundEnvelope, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::DecodeFailed(e.to_string()))
    }

    fn encode(message: &OutboundMessage) -> Result<String, SignalingError> {
        serde_json::to_string(message).map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalingGateway for SignalingClient {
    async fn send(&self, message: OutboundMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let msg_string = Self::encode(&message)?;

        tx.send(msg_string)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
