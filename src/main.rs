//! Pulse Session - Kommandozeile
//!
//! Verbindet sich mit dem Signaling-Server, fordert eine Media-Verbindung
//! an und hält die Session bis Ctrl-C.

use anyhow::Context;
use pulse_session::call_engine::{init_capture, RtcPeerEngineFactory, SampleToneSource, Session};
use pulse_session::signaling::SignalingClient;
use pulse_session::SessionConfig;
use std::sync::Arc;

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080/signaling";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pulse_session::init_logging();

    let config = match std::env::var("PULSE_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path))?;
            SessionConfig::from_json(&json)?
        }
        Err(_) => SessionConfig::from_env()?,
    };

    // Default Signaling URL (kann über Umgebungsvariable überschrieben werden)
    let signaling_url =
        std::env::var("SIGNALING_URL").unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());

    let capture = init_capture(&config.capture).context("opening audio capture")?;

    let mut client = SignalingClient::new(&signaling_url)?;
    let inbound = client.subscribe();
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", signaling_url))?;

    let factory = Arc::new(RtcPeerEngineFactory::new(&config.ice_servers));
    let session = Session::new(
        config,
        Arc::new(client),
        factory,
        capture.clone_stream(),
        Arc::new(SampleToneSource),
    );
    session.on_disconnect(|| tracing::info!("Remote side disconnected"));
    let event_loop = session.start(inbound);

    let request = {
        let session = Arc::clone(&session);
        tokio::spawn(async move {
            if session.init_media_connection().await {
                tracing::info!("Media connection established");
            } else {
                tracing::warn!("Media connection could not be established");
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
        _ = event_loop => tracing::warn!("Signaling connection ended"),
    }

    request.abort();
    session.disconnect().await;
    Ok(())
}
