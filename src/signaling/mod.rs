//! Signaling Module - Nachrichten und WebSocket Gateway
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - Typisierte Nachrichten (Offer, Candidates, Media-Ready)
//! - WebSocket-Verbindung aufbauen und halten
//! - Eingehende Nachrichten parsen und weiterleiten
//!

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingGateway};
pub use messages::*;
