//! WebSocket-Kanal für Online-Status
//!
//! Hält eine persistente Verbindung zum Presence-Server:
//! - Registrierung beim Verbindungsaufbau
//! - Heartbeat-Keeping
//! - Lokale Registry aller bekannten Online-Status
//! - Automatische Reconnection mit exponentiellem Backoff

use super::messages::{HeartbeatPayload, OfflinePayload, PresenceServerMessage, RegisterPayload};
use crate::config::PresenceConfig;
use crate::connection::{reconnect_delay, ConnectionHandle, HandleState, Outbound};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
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
pub enum PresenceError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to presence server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// PRESENCE EVENTS
// ============================================================================

/// Events die vom PresenceChannel ausgelöst werden
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Verbunden und registriert
    Connected,

    /// Verbindung getrennt; `abnormal` unterscheidet Transportfehler
    /// von einem klientseitig gewollten Abbau
    Disconnected { abnormal: bool },

    /// Reconnect-Versuch geplant
    Reconnecting { attempt: u32 },

    /// Reconnect-Versuche über dem konfigurierten Limit
    ReconnectsExhausted { attempts: u32 },

    /// Online-Status eines Benutzers hat sich geändert
    StatusChanged { user_id: u64, online: bool },
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

struct ChannelInner {
    handle: Option<ConnectionHandle>,
    reconnect_pending: bool,
    shutting_down: bool,
    user_id: Option<u64>,
}

/// Von allen Tasks geteilter Zustand des Kanals
#[derive(Clone)]
struct ChannelShared {
    config: PresenceConfig,
    inner: Arc<Mutex<ChannelInner>>,
    registry: Arc<RwLock<HashMap<u64, bool>>>,
    event_tx: broadcast::Sender<PresenceEvent>,
}

// ============================================================================
// PRESENCE CHANNEL
// ============================================================================

/// Persistenter Kanal zum Presence-Server
pub struct PresenceChannel {
    shared: ChannelShared,
}

impl PresenceChannel {
    /// Erstellt einen neuen, noch nicht verbundenen Kanal
    pub fn new(config: PresenceConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: ChannelShared {
                config,
                inner: Arc::new(Mutex::new(ChannelInner {
                    handle: None,
                    reconnect_pending: false,
                    shutting_down: false,
                    user_id: None,
                })),
                registry: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Prüft ob ein Benutzer aktuell als online bekannt ist
    pub fn is_online(&self, user_id: u64) -> bool {
        self.shared
            .registry
            .read()
            .get(&user_id)
            .copied()
            .unwrap_or(false)
    }

    /// Prüft ob die Verbindung offen ist
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        matches!(inner.handle.as_ref(), Some(h) if h.state == HandleState::Open)
    }

    /// Verbindet mit dem Presence-Server und registriert den Benutzer
    pub async fn connect(&self, user_id: u64) -> Result<(), PresenceError> {
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

    /// Opportunistischer Reconnect-Hook
    ///
    /// Wird vom Einbettungs-Layer aufgerufen wenn die App wieder in den
    /// Vordergrund kommt. Verbindet neu falls der Handle nicht offen ist
    /// und kein Reconnect aussteht.
    pub fn ensure_connected(&self) {
        let should_open = {
            let inner = self.shared.inner.lock();
            !inner.shutting_down
                && !inner.reconnect_pending
                && inner.user_id.is_some()
                && !matches!(
                    inner.handle.as_ref(),
                    Some(h) if matches!(h.state, HandleState::Open | HandleState::Connecting)
                )
        };

        if should_open {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                if shared.open().await.is_err() {
                    shared.schedule_reconnect();
                }
            });
        }
    }

    /// Baut die Verbindung sauber ab
    ///
    /// Sendet vorher `offline`, damit die Gegenseite den Status sofort
    /// aktualisieren kann statt auf den Transport-Timeout zu warten.
    /// Ein sauberer Abbau löst keine Reconnects aus.
    pub async fn disconnect(&self) {
        let (tx, user_id) = {
            let mut inner = self.shared.inner.lock();
            inner.shutting_down = true;
            let user_id = inner.user_id;
            let tx = inner.handle.as_mut().and_then(|h| {
                if h.state == HandleState::Open {
                    h.state = HandleState::Closing;
                    h.sender()
                } else {
                    None
                }
            });
            (tx, user_id)
        };

        if let (Some(tx), Some(user_id)) = (tx, user_id) {
            if let Ok(json) = serde_json::to_string(&OfflinePayload::new(user_id)) {
                let _ = tx.send(Outbound::Frame(json)).await;
            }
            let _ = tx.send(Outbound::Close).await;
        }

        {
            let mut inner = self.shared.inner.lock();
            if let Some(h) = inner.handle.as_mut() {
                h.state = HandleState::Closed;
            }
        }

        tracing::info!("Presence channel disconnected");
    }
}

impl std::fmt::Debug for PresenceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("PresenceChannel")
            .field("user_id", &inner.user_id)
            .field("state", &inner.handle.as_ref().map(|h| h.state))
            .field("known_users", &self.shared.registry.read().len())
            .finish()
    }
}

// ============================================================================
// CONNECTION TASKS
// ============================================================================

impl ChannelShared {
    /// Öffnet eine neue Verbindung und installiert sie als aktuellen Handle
    async fn open(&self) -> Result<(), PresenceError> {
        let user_id = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(PresenceError::NotConnected);
            }
            if matches!(
                inner.handle.as_ref(),
                Some(h) if matches!(h.state, HandleState::Open | HandleState::Connecting)
            ) {
                return Ok(());
            }
            let user_id = inner.user_id.ok_or(PresenceError::NotConnected)?;
            let retry_count = inner.handle.as_ref().map(|h| h.retry_count).unwrap_or(0);
            inner.handle = Some(ConnectionHandle::connecting(retry_count));
            user_id
        };

        tracing::info!("Connecting to presence server: {}", self.config.server_url);

        let (ws_stream, _) = match connect_async(&self.config.server_url).await {
            Ok(ws) => ws,
            Err(e) => {
                let mut inner = self.inner.lock();
                if let Some(h) = inner.handle.as_mut() {
                    h.state = HandleState::Closed;
                }
                return Err(PresenceError::ConnectionFailed(e.to_string()));
            }
        };

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(100);

        // Neuen Handle atomar installieren; der alte ist damit abgelöst
        let handle_id = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return Err(PresenceError::NotConnected);
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
                            tracing::error!("Failed to send presence message: {}", e);
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
                        if let Ok(msg) = serde_json::from_str::<PresenceServerMessage>(&text) {
                            shared.handle_server_message(handle_id, msg);
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Presence connection closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Presence WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            shared.on_connection_closed(handle_id);
        });

        // Heartbeat-Task, damit Intermediaries die Verbindung offen halten
        let shared = self.clone();
        let hb_tx = tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                shared.config.heartbeat_interval_secs,
            ));
            interval.tick().await;
            loop {
                interval.tick().await;

                let still_current = {
                    let inner = shared.inner.lock();
                    matches!(
                        inner.handle.as_ref(),
                        Some(h) if h.id == handle_id && h.state == HandleState::Open
                    )
                };
                if !still_current {
                    break;
                }

                if let Ok(json) = serde_json::to_string(&HeartbeatPayload::new()) {
                    if hb_tx.send(Outbound::Frame(json)).await.is_err() {
                        break;
                    }
                }
            }
        });

        // Registrierung senden
        let register = serde_json::to_string(&RegisterPayload::new(user_id))
            .map_err(|e| PresenceError::SendFailed(e.to_string()))?;
        tx.send(Outbound::Frame(register))
            .await
            .map_err(|e| PresenceError::SendFailed(e.to_string()))?;

        let _ = self.event_tx.send(PresenceEvent::Connected);
        tracing::info!("Presence channel registered as user {}", user_id);

        Ok(())
    }

    /// Verarbeitet eine Server-Nachricht, sofern sie von der aktuell
    /// installierten Verbindung stammt
    fn handle_server_message(&self, handle_id: Uuid, msg: PresenceServerMessage) {
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

    fn apply_server_message(&self, msg: PresenceServerMessage) {
        match msg {
            PresenceServerMessage::Status { user_id, online } => {
                self.registry.write().insert(user_id, online);
                let _ = self
                    .event_tx
                    .send(PresenceEvent::StatusChanged { user_id, online });
            }

            PresenceServerMessage::InitialStatus { users } => {
                // Snapshot beim Verbindungsaufbau: gelistete Benutzer sind
                // online, ungelistete behalten ihren bekannten Status
                let mut registry = self.registry.write();
                for user_id in users {
                    registry.insert(user_id, true);
                }
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
                    abnormal
                }
                // Handle wurde bereits ersetzt, nichts zu tun
                _ => return,
            }
        };

        let _ = self.event_tx.send(PresenceEvent::Disconnected { abnormal });

        if abnormal {
            self.schedule_reconnect();
        }
    }

    /// Plant genau einen Reconnect-Versuch
    ///
    /// Gleichzeitige Trigger (abnormaler Close und ensure_connected)
    /// werden über `reconnect_pending` dedupliziert.
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
                tracing::error!("Presence reconnects exhausted after {} attempts", attempts);
                let _ = self
                    .event_tx
                    .send(PresenceEvent::ReconnectsExhausted { attempts });
            }
            Some(Ok(attempt)) => {
                let delay = reconnect_delay(attempt);
                tracing::info!(
                    "Scheduling presence reconnect attempt {} in {:?}",
                    attempt,
                    delay
                );
                let _ = self.event_tx.send(PresenceEvent::Reconnecting { attempt });

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

    #[test]
    fn test_status_updates_registry() {
        let channel = PresenceChannel::new(PresenceConfig::default());

        assert!(!channel.is_online(23));

        channel
            .shared
            .apply_server_message(PresenceServerMessage::Status {
                user_id: 23,
                online: true,
            });
        assert!(channel.is_online(23));

        channel
            .shared
            .apply_server_message(PresenceServerMessage::Status {
                user_id: 23,
                online: false,
            });
        assert!(!channel.is_online(23));
    }

    #[test]
    fn test_initial_status_keeps_unlisted_entries() {
        let channel = PresenceChannel::new(PresenceConfig::default());

        // Benutzer 7 ist als offline bekannt
        channel
            .shared
            .apply_server_message(PresenceServerMessage::Status {
                user_id: 7,
                online: false,
            });

        channel
            .shared
            .apply_server_message(PresenceServerMessage::InitialStatus {
                users: vec![1, 2, 3],
            });

        assert!(channel.is_online(1));
        assert!(channel.is_online(2));
        assert!(channel.is_online(3));
        // ungelisteter Benutzer behält seinen Status
        assert!(!channel.is_online(7));
    }

    #[test]
    fn test_message_from_superseded_handle_ignored() {
        let channel = PresenceChannel::new(PresenceConfig::default());

        // Kein Handle installiert: Nachricht muss verworfen werden
        channel.shared.handle_server_message(
            Uuid::new_v4(),
            PresenceServerMessage::Status {
                user_id: 42,
                online: true,
            },
        );
        assert!(!channel.is_online(42));
    }

    #[test]
    fn test_status_change_emits_event() {
        let channel = PresenceChannel::new(PresenceConfig::default());
        let mut rx = channel.subscribe();

        channel
            .shared
            .apply_server_message(PresenceServerMessage::Status {
                user_id: 23,
                online: true,
            });

        match rx.try_recv() {
            Ok(PresenceEvent::StatusChanged { user_id, online }) => {
                assert_eq!(user_id, 23);
                assert!(online);
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_without_connection_is_noop() {
        // disconnect() ohne vorheriges connect() darf nicht hängen
        let channel = PresenceChannel::new(PresenceConfig::default());
        futures::executor::block_on(channel.disconnect());
        assert!(!channel.is_connected());
    }
}
