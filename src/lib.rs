//! Pulse Session - WebRTC Session Negotiation
//!
//! Baut eine bidirektionale Audio-Session zwischen zwei Endpunkten auf:
//! - WebSocket Signaling für Offer/Answer und ICE Candidates
//! - webrtc-rs als Peer Engine für Transport und Verschlüsselung
//! - PCMU Audio aus Mikrofon oder WAV-Datei
//! - Transmit-Ton beim Unmute

pub mod call_engine;
pub mod config;
pub mod signaling;

#[cfg(test)]
mod test_support;

pub use call_engine::{Session, SessionState};
pub use config::{CaptureSource, ConfigError, IceServerConfig, SessionConfig};

use tracing_subscriber::EnvFilter;

/// Default-Filter wenn `RUST_LOG` nichts anderes sagt
const DEFAULT_LOG_DIRECTIVES: [&str; 2] = ["pulse_session=debug", "webrtc=warn"];

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging. Weitere Aufrufe haben keine Wirkung.
pub fn init_logging() {
    let mut filter = EnvFilter::from_default_env();
    for directive in DEFAULT_LOG_DIRECTIVES {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
        }
    }

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("Logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
