//! Konfiguration für Presence, Signaling und Call-Policy
//!
//! Alle Werte haben sinnvolle Defaults und können aus einer JSON-Datei
//! geladen werden. Die Dauer-Tabelle (Call-Day → erlaubte Sekunden) ist
//! bewusst Konfiguration und keine fest verdrahtete Business-Logik.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// PRESENCE
// ============================================================================

/// Konfiguration des Presence-Kanals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// WebSocket-URL des Presence-Servers
    pub server_url: String,

    /// Heartbeat-Intervall in Sekunden
    pub heartbeat_interval_secs: u64,

    /// Maximale Anzahl aufeinanderfolgender Reconnect-Versuche,
    /// bevor der Fehler nach oben gemeldet wird
    pub max_reconnect_attempts: u32,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://presence.example.com/ws".to_string(),
            heartbeat_interval_secs: 15,
            max_reconnect_attempts: 10,
        }
    }
}

// ============================================================================
// SIGNALING
// ============================================================================

/// Konfiguration des Signaling-Transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket-URL des Signaling-Servers
    pub server_url: String,

    /// Wartezeit auf die Room-Join-Bestätigung in Sekunden
    pub join_timeout_secs: u64,

    /// Maximale Anzahl aufeinanderfolgender Reconnect-Versuche
    pub max_reconnect_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://signaling.example.com/ws".to_string(),
            join_timeout_secs: 5,
            max_reconnect_attempts: 10,
        }
    }
}

// ============================================================================
// WEBRTC
// ============================================================================

/// Ein STUN- oder TURN-Server-Eintrag
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Konfiguration der Peer-Verbindung
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    /// STUN/TURN-Server für die Kandidaten-Ermittlung
    pub ice_servers: Vec<IceServerConfig>,

    /// Obergrenze für die gesamte Negotiation in Sekunden
    pub negotiation_timeout_secs: u64,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            // Google STUN-Server decken die meisten Verbindungen ab;
            // TURN-Credentials kommen bei Bedarf aus der Konfigurationsdatei
            ice_servers: vec![IceServerConfig {
                urls: vec![
                    "stun:stun.l.google.com:19302".to_string(),
                    "stun:stun1.l.google.com:19302".to_string(),
                    "stun:stun2.l.google.com:19302".to_string(),
                ],
                ..Default::default()
            }],
            negotiation_timeout_secs: 30,
        }
    }
}

// ============================================================================
// CALL POLICY
// ============================================================================

/// Ein Eintrag der Dauer-Tabelle: ab `from_day` sind `seconds` erlaubt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DurationStep {
    pub from_day: u32,
    pub seconds: u32,
}

/// Konfiguration der Anrufdauer-Policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallPolicyConfig {
    /// Dauer-Tabelle, aufsteigend nach `from_day`
    pub schedule: Vec<DurationStep>,
}

impl Default for CallPolicyConfig {
    fn default() -> Self {
        Self {
            schedule: vec![
                DurationStep { from_day: 1, seconds: 300 },
                DurationStep { from_day: 2, seconds: 600 },
                DurationStep { from_day: 3, seconds: 900 },
                DurationStep { from_day: 5, seconds: 1800 },
                DurationStep { from_day: 7, seconds: 3600 },
            ],
        }
    }
}

// ============================================================================
// APP CONFIG
// ============================================================================

/// Gesamte Konfiguration des Real-Time-Kerns
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub presence: PresenceConfig,
    pub signaling: SignalingConfig,
    pub rtc: RtcConfig,
    pub call: CallPolicyConfig,
}

impl AppConfig {
    /// Lädt die Konfiguration aus einer JSON-Datei
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Prüft die Server-URLs auf syntaktische Gültigkeit
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.presence.server_url)
            .with_context(|| format!("invalid presence URL {}", self.presence.server_url))?;
        url::Url::parse(&self.signaling.server_url)
            .with_context(|| format!("invalid signaling URL {}", self.signaling.server_url))?;
        Ok(())
    }
}
