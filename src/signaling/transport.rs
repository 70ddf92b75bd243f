//! WebSocket-Transport für Signaling
//!
//! Verwaltet die Verbindung zum Signaling-Server:
//! - Raum-Beitritt mit begrenzter Wartezeit auf die Bestätigung
//! - Negotiation-Payloads (Offer, Answer, Candidate) rahmen und zustellen
//! - Eingehende Frames in typisierte Events demultiplexen
//! - Eigene Reconnection-Policy, unabhängig vom Presence-Kanal

use super::messages::{
    AnswerPayload, ByePayload, CandidatePayload, OfferPayload, RoomJoinPayload, RoomLeavePayload,
    SignalingServerMessage,
};
use crate::config::SignalingConfig;
use crate::connection::{reconnect_delay, ConnectionHandle, HandleState, Outbound};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Room join not acknowledged: {0}")]
    RoomNotFound(String),

    #[error("Room join aborted")]
    JoinAborted,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingTransport ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbindungsaufbau läuft
    Connecting,

    /// Verbunden mit dem Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected { reason: String },

    /// Reconnect-Versuch geplant
    Reconnecting { attempt: u32 },

    /// Fehler vom Server oder Transport
    Error { code: i32, message: String },

    /// Raum-Beitritt bestätigt
    RoomJoined {
        room_id: String,
        participants: Vec<u64>,
    },

    /// Teilnehmer ist dem Raum beigetreten
    ParticipantJoined { user_id: u64 },

    /// Teilnehmer hat den Raum verlassen
    ParticipantLeft { user_id: u64 },

    /// Eingehendes SDP Offer
    Offer { sdp: String },

    /// Eingehendes SDP Answer
    Answer { sdp: String },

    /// Eingehender ICE Candidate
    Candidate { candidate: String },

    /// Abschied der Gegenseite (Ablehnung oder Auflegen)
    Bye { reason: Option<String> },
}

/// Ausgehende Negotiation-Nachrichten
#[derive(Debug, Clone)]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: String },
    Bye { reason: Option<String> },
}

// ============================================================================
// ROOM MEMBERSHIP
// ============================================================================

/// Mitgliedschaft in einem Signaling-Raum
///
/// Existiert vom bestätigten Beitritt bis zum Verlassen oder Disconnect.
#[derive(Debug, Clone)]
pub struct RoomMembership {
    pub room_id: String,
    pub participant_ids: HashSet<u64>,
}

// ============================================================================
// TRANSPORT STATE
// ============================================================================

/// Wartender Raum-Beitritt bis zur Server-Bestätigung
struct PendingJoin {
    room_id: String,
    ack_tx: mpsc::Sender<Vec<u64>>,
}

struct TransportInner {
    handle: Option<ConnectionHandle>,
    reconnect_pending: bool,
    shutting_down: bool,
    user_id: Option<u64>,
    membership: Option<RoomMembership>,
    pending_join: Option<PendingJoin>,
}

/// Von allen Tasks geteilter Zustand des Transports
#[derive(Clone)]
struct TransportShared {
    config: SignalingConfig,
    inner: Arc<Mutex<TransportInner>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

// ============================================================================
// SIGNALING TRANSPORT
// ============================================================================

/// Transport-Schicht zum Signaling-Server
pub struct SignalingTransport {
    shared: TransportShared,
}

impl SignalingTransport {
    /// Erstellt einen neuen, noch nicht verbundenen Transport
    pub fn new(config: SignalingConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: TransportShared {
                config,
                inner: Arc::new(Mutex::new(TransportInner {
                    handle: None,
                    reconnect_pending: false,
                    shutting_down: false,
                    user_id: None,
                    membership: None,
                    pending_join: None,
                })),
                event_tx,
            },
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Prüft ob die Verbindung offen ist
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        matches!(inner.handle.as_ref(), Some(h) if h.state == HandleState::Open)
    }

    /// Aktuelle Raum-Mitgliedschaft, falls vorhanden
    pub fn current_room(&self) -> Option<RoomMembership> {
        self.shared.inner.lock().membership.clone()
    }

    /// Verbindet mit dem Signaling-Server
    pub async fn connect(&self, user_id: u64) -> Result<(), SignalingError> {
        {
            let mut inner = self.shared.inner.lock();
            if matches!(
                inner.handle.as_ref(),
                Some(h) if matches!(h.state, HandleState::Open | HandleState::Connecting)
            ) {
                return Ok(());
            }
            inner.user_id = Some(user_id);
            inner.shutting_down = false;
        }

        self.shared.open().await
    }

    /// Tritt einem Raum bei und wartet begrenzt auf die Bestätigung
    ///
    /// Gibt die bereits anwesenden Teilnehmer zurück. Bleibt die
    /// Bestätigung innerhalb des Join-Timeouts aus, schlägt der Aufruf
    /// mit `RoomNotFound` fehl statt unbegrenzt zu hängen.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<u64>, SignalingError> {
        let (ack_tx, mut ack_rx) = mpsc::channel::<Vec<u64>>(1);

        let (tx, user_id) = {
            let mut inner = self.shared.inner.lock();
            let tx = inner
                .handle
                .as_ref()
                .filter(|h| h.state == HandleState::Open)
                .and_then(|h| h.sender())
                .ok_or(SignalingError::NotConnected)?;
            let user_id = inner.user_id.ok_or(SignalingError::NotConnected)?;
            inner.pending_join = Some(PendingJoin {
                room_id: room_id.to_string(),
                ack_tx,
            });
            (tx, user_id)
        };

        let json = serde_json::to_string(&RoomJoinPayload::new(room_id.to_string(), user_id))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        tx.send(Outbound::Frame(json))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tracing::info!("Joining room {}", room_id);

        tokio::select! {
            ack = ack_rx.recv() => match ack {
                Some(participants) => Ok(participants),
                // Sender wurde gedroppt: Leave oder Disconnect während des Joins
                None => Err(SignalingError::JoinAborted),
            },
            _ = tokio::time::sleep(Duration::from_secs(self.shared.config.join_timeout_secs)) => {
                let mut inner = self.shared.inner.lock();
                inner.pending_join = None;
                tracing::warn!("Room join timed out: {}", room_id);
                Err(SignalingError::RoomNotFound(room_id.to_string()))
            }
        }
    }

    /// Verlässt den aktuellen Raum
    ///
    /// Idempotent: ohne Mitgliedschaft ist der Aufruf ein No-Op.
    pub async fn leave_room(&self) -> Result<(), SignalingError> {
        let send = {
            let mut inner = self.shared.inner.lock();
            // ein wartender Join wird mit abgebrochen
            inner.pending_join = None;
            match inner.membership.take() {
                Some(membership) => {
                    let tx = inner
                        .handle
                        .as_ref()
                        .filter(|h| h.state == HandleState::Open)
                        .and_then(|h| h.sender());
                    inner
                        .user_id
                        .and_then(|user_id| tx.map(|tx| (tx, membership.room_id, user_id)))
                }
                None => None,
            }
        };

        if let Some((tx, room_id, user_id)) = send {
            let json = serde_json::to_string(&RoomLeavePayload::new(room_id.clone(), user_id))
                .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
            let _ = tx.send(Outbound::Frame(json)).await;
            tracing::info!("Left room {}", room_id);
        }

        Ok(())
    }

    /// Sendet eine Negotiation-Nachricht in den aktuellen Raum
    pub async fn send_signal(&self, signal: Signal) -> Result<(), SignalingError> {
        let (tx, room_id) = {
            let inner = self.shared.inner.lock();
            let room_id = inner
                .membership
                .as_ref()
                .map(|m| m.room_id.clone())
                .ok_or(SignalingError::NotInRoom)?;
            let tx = inner
                .handle
                .as_ref()
                .filter(|h| h.state == HandleState::Open)
                .and_then(|h| h.sender())
                .ok_or(SignalingError::NotConnected)?;
            (tx, room_id)
        };

        let json = match signal {
            Signal::Offer { sdp } => serde_json::to_string(&OfferPayload::new(room_id, sdp)),
            Signal::Answer { sdp } => serde_json::to_string(&AnswerPayload::new(room_id, sdp)),
            Signal::Candidate { candidate } => {
                serde_json::to_string(&CandidatePayload::new(room_id, candidate))
            }
            Signal::Bye { reason } => serde_json::to_string(&ByePayload::new(room_id, reason)),
        }
        .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        tx.send(Outbound::Frame(json))
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    /// Baut die Verbindung sauber ab
    pub async fn disconnect(&self) {
        let _ = self.leave_room().await;

        let tx = {
            let mut inner = self.shared.inner.lock();
            inner.shutting_down = true;
            inner.handle.as_mut().and_then(|h| {
                if h.state == HandleState::Open {
                    h.state = HandleState::Closing;
                    h.sender()
                } else {
                    None
                }
            })
        };

        if let Some(tx) = tx {
            let _ = tx.send(Outbound::Close).await;
        }

        {
            let mut inner = self.shared.inner.lock();
            if let Some(h) = inner.handle.as_mut() {
                h.state = HandleState::Closed;
            }
        }

        tracing::info!("Signaling transport disconnected");
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("SignalingTransport")
            .field("user_id", &inner.user_id)
            .field("state", &inner.handle.as_ref().map(|h| h.state))
            .field("room", &inner.membership.as_ref().map(|m| &m.room_id))
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

impl TransportShared {
    /// Öffnet eine neue Verbindung und installiert sie als aktuellen Handle
    async fn open(&self) -> Result<(), SignalingError> {
        {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(SignalingError::NotConnected);
            }
            if matches!(
                inner.handle.as_ref(),
                Some(h) if matches!(h.state, HandleState::Open | HandleState::Connecting)
            ) {
                return Ok(());
            }
            let retry_count = inner.handle.as_ref().map(|h| h.retry_count).unwrap_or(0);
            inner.handle = Some(ConnectionHandle::connecting(retry_count));
        }

        let _ = self.event_tx.send(SignalingEvent::Connecting);
        tracing::info!("Connecting to signaling server: {}", self.config.server_url);

        let (ws_stream, _) = match connect_async(&self.config.server_url).await {
            Ok(ws) => ws,
            Err(e) => {
                let mut inner = self.inner.lock();
                if let Some(h) = inner.handle.as_mut() {
                    h.state = HandleState::Closed;
                }
                return Err(SignalingError::ConnectionFailed(e.to_string()));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(100);

        // Neuen Handle atomar installieren; der alte ist damit abgelöst
        let handle_id = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(SignalingError::NotConnected);
            }
            let handle = ConnectionHandle::opened(tx.clone());
            let id = handle.id;
            inner.handle = Some(handle);
            inner.reconnect_pending = false;
            id
        };

        // Write-Task
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                match out {
                    Outbound::Frame(msg) => {
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            tracing::error!("Failed to send signaling message: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Read-Task
        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        if let Ok(msg) = serde_json::from_str::<SignalingServerMessage>(&text) {
                            shared.handle_server_message(handle_id, msg);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Signaling connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            shared.on_connection_closed(handle_id);
        });

        let _ = self.event_tx.send(SignalingEvent::Connected);
        tracing::info!("Signaling transport connected");

        Ok(())
    }

    /// Verarbeitet eine Server-Nachricht, sofern sie von der aktuell
    /// installierten Verbindung stammt
    fn handle_server_message(&self, handle_id: Uuid, msg: SignalingServerMessage) {
        {
            let inner = self.inner.lock();
            match inner.handle.as_ref() {
                Some(h) if h.id == handle_id => {}
                // Nachricht einer abgelösten Verbindung
                _ => return,
            }
        }

        self.apply_server_message(msg);
    }

    fn apply_server_message(&self, msg: SignalingServerMessage) {
        match msg {
            SignalingServerMessage::RoomJoined {
                room_id,
                participants,
            } => {
                let ack = {
                    let mut inner = self.inner.lock();
                    inner.membership = Some(RoomMembership {
                        room_id: room_id.clone(),
                        participant_ids: participants.iter().copied().collect(),
                    });
                    match inner.pending_join.take() {
                        Some(pending) if pending.room_id == room_id => Some(pending.ack_tx),
                        Some(pending) => {
                            // Bestätigung für einen anderen Raum, Join wartet weiter
                            inner.pending_join = Some(pending);
                            None
                        }
                        None => None,
                    }
                };

                if let Some(ack_tx) = ack {
                    let _ = ack_tx.try_send(participants.clone());
                }

                let _ = self.event_tx.send(SignalingEvent::RoomJoined {
                    room_id,
                    participants,
                });
            }

            SignalingServerMessage::ParticipantJoined { user_id, .. } => {
                {
                    let mut inner = self.inner.lock();
                    if let Some(membership) = inner.membership.as_mut() {
                        membership.participant_ids.insert(user_id);
                    }
                }
                let _ = self
                    .event_tx
                    .send(SignalingEvent::ParticipantJoined { user_id });
            }

            SignalingServerMessage::ParticipantLeft { user_id, .. } => {
                {
                    let mut inner = self.inner.lock();
                    if let Some(membership) = inner.membership.as_mut() {
                        membership.participant_ids.remove(&user_id);
                    }
                }
                let _ = self
                    .event_tx
                    .send(SignalingEvent::ParticipantLeft { user_id });
            }

            SignalingServerMessage::Offer { sdp, .. } => {
                let _ = self.event_tx.send(SignalingEvent::Offer { sdp });
            }

            SignalingServerMessage::Answer { sdp, .. } => {
                let _ = self.event_tx.send(SignalingEvent::Answer { sdp });
            }

            SignalingServerMessage::Candidate { candidate, .. } => {
                let _ = self.event_tx.send(SignalingEvent::Candidate { candidate });
            }

            SignalingServerMessage::Bye { reason, .. } => {
                let _ = self.event_tx.send(SignalingEvent::Bye { reason });
            }

            SignalingServerMessage::Error { code, message } => {
                tracing::error!("Signaling server error {}: {}", code, message);
                let _ = self.event_tx.send(SignalingEvent::Error { code, message });
            }
        }
    }

    /// Reagiert auf das Ende des Read-Tasks
    fn on_connection_closed(&self, handle_id: Uuid) {
        let abnormal = {
            let mut inner = self.inner.lock();
            let shutting_down = inner.shutting_down;
            match inner.handle.as_mut() {
                Some(h) if h.id == handle_id => {
                    let abnormal = !shutting_down && h.state != HandleState::Closing;
                    h.state = HandleState::Closed;
                    // Mitgliedschaft und wartende Joins enden mit der Verbindung
                    inner.membership = None;
                    inner.pending_join = None;
                    abnormal
                }
                // Handle wurde bereits ersetzt, nichts zu tun
                _ => return,
            }
        };

        let reason = if abnormal {
            "connection-lost"
        } else {
            "client-close"
        };
        let _ = self.event_tx.send(SignalingEvent::Disconnected {
            reason: reason.to_string(),
        });

        if abnormal {
            self.schedule_reconnect();
        }
    }

    /// Plant genau einen Reconnect-Versuch; gleichzeitige Trigger werden
    /// über `reconnect_pending` dedupliziert
    fn schedule_reconnect(&self) {
        let decision = {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.reconnect_pending {
                None
            } else if let Some(handle) = inner.handle.as_mut() {
                let attempt = handle.retry_count;
                handle.retry_count += 1;
                if attempt >= self.config.max_reconnect_attempts {
                    Some(Err(attempt))
                } else {
                    inner.reconnect_pending = true;
                    Some(Ok(attempt))
                }
            } else {
                None
            }
        };

        match decision {
            None => {}
            Some(Err(attempts)) => {
                tracing::error!("Signaling reconnects exhausted after {} attempts", attempts);
                let _ = self.event_tx.send(SignalingEvent::Error {
                    code: -1,
                    message: format!("reconnect attempts exhausted after {}", attempts),
                });
            }
            Some(Ok(attempt)) => {
                let delay = reconnect_delay(attempt);
                tracing::info!(
                    "Scheduling signaling reconnect attempt {} in {:?}",
                    attempt,
                    delay
                );
                let _ = self.event_tx.send(SignalingEvent::Reconnecting { attempt });

                let shared = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut inner = shared.inner.lock();
                        inner.reconnect_pending = false;
                        if inner.shutting_down {
                            return;
                        }
                    }
                    if shared.open().await.is_err() {
                        shared.schedule_reconnect();
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install_open_handle(transport: &SignalingTransport) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(8);
        let mut inner = transport.shared.inner.lock();
        inner.handle = Some(ConnectionHandle::opened(tx));
        inner.user_id = Some(23);
        rx
    }

    #[test]
    fn test_room_joined_updates_membership_and_emits() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        let mut rx = transport.subscribe();

        transport
            .shared
            .apply_server_message(SignalingServerMessage::RoomJoined {
                room_id: "match-17".to_string(),
                participants: vec![42],
            });

        let membership = transport.current_room().unwrap();
        assert_eq!(membership.room_id, "match-17");
        assert!(membership.participant_ids.contains(&42));

        match rx.try_recv() {
            Ok(SignalingEvent::RoomJoined {
                room_id,
                participants,
            }) => {
                assert_eq!(room_id, "match-17");
                assert_eq!(participants, vec![42]);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_participant_events_update_membership() {
        let transport = SignalingTransport::new(SignalingConfig::default());

        transport
            .shared
            .apply_server_message(SignalingServerMessage::RoomJoined {
                room_id: "match-17".to_string(),
                participants: vec![],
            });
        transport
            .shared
            .apply_server_message(SignalingServerMessage::ParticipantJoined {
                room_id: "match-17".to_string(),
                user_id: 42,
            });

        assert!(transport
            .current_room()
            .unwrap()
            .participant_ids
            .contains(&42));

        transport
            .shared
            .apply_server_message(SignalingServerMessage::ParticipantLeft {
                room_id: "match-17".to_string(),
                user_id: 42,
            });

        assert!(!transport
            .current_room()
            .unwrap()
            .participant_ids
            .contains(&42));
    }

    #[tokio::test]
    async fn test_leave_room_without_join_is_noop() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        assert!(transport.leave_room().await.is_ok());
        assert!(transport.current_room().is_none());
    }

    #[tokio::test]
    async fn test_join_room_requires_connection() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        let result = transport.join_room("match-17").await;
        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_room_times_out_without_ack() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        // Offener Handle ohne Server dahinter: die Bestätigung bleibt aus
        let mut frame_rx = install_open_handle(&transport);

        let result = transport.join_room("match-17").await;
        assert!(matches!(result, Err(SignalingError::RoomNotFound(_))));

        // der Join-Frame wurde trotzdem gesendet
        match frame_rx.recv().await {
            Some(Outbound::Frame(json)) => assert!(json.contains(r#""type":"roomJoin""#)),
            _ => panic!("Expected a join frame"),
        }
        // und der wartende Join ist aufgeräumt
        assert!(transport.shared.inner.lock().pending_join.is_none());
    }

    #[tokio::test]
    async fn test_join_ack_resolves_join() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        let _frame_rx = install_open_handle(&transport);

        let join = transport.join_room("match-17");
        let shared = transport.shared.clone();
        let ack = async move {
            // Bestätigung eintreffen lassen sobald der Join wartet
            loop {
                if shared.inner.lock().pending_join.is_some() {
                    break;
                }
                tokio::task::yield_now().await;
            }
            shared.apply_server_message(SignalingServerMessage::RoomJoined {
                room_id: "match-17".to_string(),
                participants: vec![42],
            });
        };

        let (result, _) = tokio::join!(join, ack);
        assert_eq!(result.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_send_signal_requires_room() {
        let transport = SignalingTransport::new(SignalingConfig::default());
        let _frame_rx = install_open_handle(&transport);

        let result = transport
            .send_signal(Signal::Offer {
                sdp: "v=0".to_string(),
            })
            .await;
        assert!(matches!(result, Err(SignalingError::NotInRoom)));
    }
}
