//! Session-Konfiguration
//!
//! Wird entweder aus Umgebungsvariablen gelesen oder als JSON geladen.
//! Fehlende Werte fallen auf die Defaults zurück.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default für das Warten auf Media-Ready
pub const DEFAULT_MEDIA_READY_TIMEOUT_MS: u64 = 10_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Ein STUN/TURN Server
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn to_rtc(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Quelle des lokalen Audio-Streams
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    #[default]
    Microphone,
    /// WAV-Datei in Dauerschleife, zum Debuggen ohne Mikrofon
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServerConfig>,
    /// Transmit-Ton beim Unmute
    pub tone_enabled: bool,
    pub capture: CaptureSource,
    /// `None` wartet unbegrenzt auf Media-Ready
    pub media_ready_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            tone_enabled: false,
            capture: CaptureSource::Microphone,
            media_ready_timeout_ms: Some(DEFAULT_MEDIA_READY_TIMEOUT_MS),
        }
    }
}

impl SessionConfig {
    /// Liest die Konfiguration aus den `PULSE_*` Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(servers) = lookup("PULSE_ICE_SERVERS") {
            config.ice_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| IceServerConfig {
                    urls: vec![url.to_string()],
                    username: None,
                    credential: None,
                })
                .collect();
        }

        if let Some(value) = lookup("PULSE_TONE_ENABLED") {
            config.tone_enabled = parse_flag("PULSE_TONE_ENABLED", &value)?;
        }

        if let Some(path) = lookup("PULSE_CAPTURE_FILE").filter(|p| !p.is_empty()) {
            config.capture = CaptureSource::File(PathBuf::from(path));
        }

        if let Some(value) = lookup("PULSE_MEDIA_READY_TIMEOUT_MS") {
            let ms: u64 = value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: "PULSE_MEDIA_READY_TIMEOUT_MS",
                value: value.clone(),
            })?;
            // 0 schaltet den Timeout ab
            config.media_ready_timeout_ms = (ms > 0).then_some(ms);
        }

        Ok(config)
    }

    pub fn media_ready_timeout(&self) -> Option<Duration> {
        self.media_ready_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.ice_servers.is_empty());
        assert!(!config.tone_enabled);
        assert_eq!(config.capture, CaptureSource::Microphone);
        assert_eq!(config.media_ready_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_from_env_vars() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("PULSE_ICE_SERVERS", "stun:stun.l.google.com:19302, turn:turn.example.org"),
            ("PULSE_TONE_ENABLED", "true"),
            ("PULSE_CAPTURE_FILE", "/tmp/test.wav"),
            ("PULSE_MEDIA_READY_TIMEOUT_MS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].urls, vec!["turn:turn.example.org"]);
        assert!(config.tone_enabled);
        assert_eq!(config.capture, CaptureSource::File(PathBuf::from("/tmp/test.wav")));
        assert_eq!(config.media_ready_timeout(), None);
    }

    #[test]
    fn test_invalid_values() {
        let result = SessionConfig::from_lookup(lookup(&[("PULSE_TONE_ENABLED", "maybe")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));

        let result =
            SessionConfig::from_lookup(lookup(&[("PULSE_MEDIA_READY_TIMEOUT_MS", "soon")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_json() {
        let config = SessionConfig::from_json(
            r#"{
                "ice_servers": [
                    { "urls": ["turn:turn.example.org"], "username": "pulse", "credential": "secret" }
                ],
                "tone_enabled": true,
                "capture": { "file": "debug.wav" }
            }"#,
        )
        .unwrap();

        assert!(config.tone_enabled);
        assert_eq!(config.capture, CaptureSource::File(PathBuf::from("debug.wav")));
        assert_eq!(
            config.media_ready_timeout_ms,
            Some(DEFAULT_MEDIA_READY_TIMEOUT_MS)
        );

        let rtc = config.ice_servers[0].to_rtc();
        assert_eq!(rtc.username, "pulse");
        assert_eq!(rtc.credential, "secret");
    }
}
