//! Message-Typen für das Presence-Protokoll
//!
//! JSON-Records über die persistente Verbindung; das `type`-Feld
//! diskriminiert. Felder sind camelCase wie auf der Server-Seite.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Anmeldung beim Presence-Server nach dem Verbindungsaufbau
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "userId")]
    pub user_id: u64,
    pub timestamp: i64,
}

impl RegisterPayload {
    pub fn new(user_id: u64) -> Self {
        Self {
            msg_type: "register",
            user_id,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Keep-Alive, damit Intermediaries die Verbindung nicht schließen
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub timestamp: i64,
}

impl HeartbeatPayload {
    pub fn new() -> Self {
        Self {
            msg_type: "heartbeat",
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

impl Default for HeartbeatPayload {
    fn default() -> Self {
        Self::new()
    }
}

/// Expliziter Abgang vor einem sauberen Verbindungsabbau,
/// damit die Gegenseite nicht auf den Transport-Timeout warten muss
#[derive(Debug, Clone, Serialize)]
pub struct OfflinePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "userId")]
    pub user_id: u64,
    pub timestamp: i64,
}

impl OfflinePayload {
    pub fn new(user_id: u64) -> Self {
        Self {
            msg_type: "offline",
            user_id,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Nachrichten des Presence-Servers
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PresenceServerMessage {
    /// Einzelnes Status-Update für einen Benutzer
    Status {
        #[serde(rename = "userId")]
        user_id: u64,
        online: bool,
    },

    /// Bulk-Snapshot beim Verbindungsaufbau: alle gelisteten Benutzer
    /// sind online, ungelistete behalten ihren bekannten Status
    InitialStatus { users: Vec<u64> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_serialize() {
        let payload = RegisterPayload::new(23);
        let json = serde_json::to_string(&payload).unwrap();

        // type-Diskriminator und camelCase userId müssen auf dem Draht stehen
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains(r#""userId":23"#));
    }

    #[test]
    fn test_status_deserialize() {
        let msg: PresenceServerMessage =
            serde_json::from_str(r#"{"type":"status","userId":23,"online":true}"#).unwrap();

        match msg {
            PresenceServerMessage::Status { user_id, online } => {
                assert_eq!(user_id, 23);
                assert!(online);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_initial_status_deserialize() {
        let msg: PresenceServerMessage =
            serde_json::from_str(r#"{"type":"initialStatus","users":[1,2,3]}"#).unwrap();

        match msg {
            PresenceServerMessage::InitialStatus { users } => {
                assert_eq!(users, vec![1, 2, 3]);
            }
            _ => panic!("Wrong message type"),
        }
    }
}
