//! Message-Typen für das Signaling-Protokoll
//!
//! Raum-basiertes Framing: Join/Leave plus die Negotiation-Payloads
//! (Offer, Answer, ICE Candidate). Das `type`-Feld diskriminiert,
//! Felder sind camelCase wie auf der Server-Seite.

use chrono::Utc;
use serde::{Deserialize, Serialize};

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Raum beitreten
#[derive(Debug, Clone, Serialize)]
pub struct RoomJoinPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "userId")]
    pub user_id: u64,
    pub timestamp: i64,
}

impl RoomJoinPayload {
    pub fn new(room_id: String, user_id: u64) -> Self {
        Self {
            msg_type: "roomJoin",
            room_id,
            user_id,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Raum verlassen
#[derive(Debug, Clone, Serialize)]
pub struct RoomLeavePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "userId")]
    pub user_id: u64,
    pub timestamp: i64,
}

impl RoomLeavePayload {
    pub fn new(room_id: String, user_id: u64) -> Self {
        Self {
            msg_type: "roomLeave",
            room_id,
            user_id,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// SDP Offer an die Gegenseite
#[derive(Debug, Clone, Serialize)]
pub struct OfferPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl OfferPayload {
    pub fn new(room_id: String, sdp: String) -> Self {
        Self {
            msg_type: "offer",
            room_id,
            sdp,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// SDP Answer an die Gegenseite
#[derive(Debug, Clone, Serialize)]
pub struct AnswerPayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub sdp: String,
    pub timestamp: i64,
}

impl AnswerPayload {
    pub fn new(room_id: String, sdp: String) -> Self {
        Self {
            msg_type: "answer",
            room_id,
            sdp,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// ICE Candidate, sobald lokal ermittelt (Trickle-ICE)
#[derive(Debug, Clone, Serialize)]
pub struct CandidatePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub candidate: String,
    pub timestamp: i64,
}

impl CandidatePayload {
    pub fn new(room_id: String, candidate: String) -> Self {
        Self {
            msg_type: "candidate",
            room_id,
            candidate,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Expliziter Abschied (Ablehnung oder Auflegen), damit die Gegenseite
/// nicht erst am Raum-Austritt erkennen muss warum die Session endet
#[derive(Debug, Clone, Serialize)]
pub struct ByePayload {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: i64,
}

impl ByePayload {
    pub fn new(room_id: String, reason: Option<String>) -> Self {
        Self {
            msg_type: "bye",
            room_id,
            reason,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Nachrichten des Signaling-Servers
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SignalingServerMessage {
    /// Bestätigung des Raum-Beitritts mit den bereits anwesenden Teilnehmern
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        participants: Vec<u64>,
    },

    /// Ein Teilnehmer ist dem Raum beigetreten
    ParticipantJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: u64,
    },

    /// Ein Teilnehmer hat den Raum verlassen
    ParticipantLeft {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: u64,
    },

    /// Eingehendes SDP Offer
    Offer {
        #[serde(rename = "roomId")]
        room_id: String,
        sdp: String,
    },

    /// Eingehendes SDP Answer
    Answer {
        #[serde(rename = "roomId")]
        room_id: String,
        sdp: String,
    },

    /// Eingehender ICE Candidate
    Candidate {
        #[serde(rename = "roomId")]
        room_id: String,
        candidate: String,
    },

    /// Abschied der Gegenseite
    Bye {
        #[serde(rename = "roomId")]
        room_id: String,
        reason: Option<String>,
    },

    /// Fehler vom Server
    Error { code: i32, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_join_serialize() {
        let payload = RoomJoinPayload::new("match-17".to_string(), 23);
        let json = serde_json::to_string(&payload).unwrap();

        assert!(json.contains(r#""type":"roomJoin""#));
        assert!(json.contains(r#""roomId":"match-17""#));
        assert!(json.contains(r#""userId":23"#));
    }

    #[test]
    fn test_bye_without_reason_omits_field() {
        let payload = ByePayload::new("match-17".to_string(), None);
        let json = serde_json::to_string(&payload).unwrap();

        assert!(json.contains(r#""type":"bye""#));
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_room_joined_deserialize() {
        let msg: SignalingServerMessage = serde_json::from_str(
            r#"{"type":"roomJoined","roomId":"match-17","participants":[42]}"#,
        )
        .unwrap();

        match msg {
            SignalingServerMessage::RoomJoined {
                room_id,
                participants,
            } => {
                assert_eq!(room_id, "match-17");
                assert_eq!(participants, vec![42]);
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_participant_left_deserialize() {
        let msg: SignalingServerMessage =
            serde_json::from_str(r#"{"type":"participantLeft","roomId":"match-17","userId":42}"#)
                .unwrap();

        match msg {
            SignalingServerMessage::ParticipantLeft { user_id, .. } => assert_eq!(user_id, 42),
            _ => panic!("Wrong message type"),
        }
    }
}
