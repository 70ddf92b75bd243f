//! Matchcall - Echtzeit-Kern für zeitbegrenzte P2P-Sprachanrufe
//!
//! Zwei gematchte Benutzer führen ein zeitlich begrenztes Sprachgespräch:
//! - Presence-Kanal für den Online-Status der Gegenseite
//! - Signaling-Transport für die Verbindungs-Negotiation
//! - Peer Session über WebRTC mit lokalem Audio
//! - Anruf-State-Machine mit Dauer-Policy pro Call-Day
//!
//! Match-Scoring, Persistenz, HTTP-API und Authentifizierung sind
//! externe Kollaborateure; dieser Kern konsumiert eine numerische
//! User-ID und einen Call-Day und meldet Lifecycle-Events zurück.

pub mod call_engine;
pub mod config;
mod connection;
pub mod presence;
pub mod signaling;

use call_engine::{
    CallError, CallEvent, CallPhase, CallSession, CallSessionManager, DurationSchedule,
    PeerSession, PeerSessionError, PolicyError,
};
use config::AppConfig;
use parking_lot::Mutex;
use presence::{PresenceChannel, PresenceError, PresenceEvent};
use signaling::{SignalingError, SignalingTransport};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid duration schedule: {0}")]
    Config(#[from] PolicyError),

    #[error("Service is not connected")]
    NotConnected,

    #[error("User {0} is not reachable")]
    CalleeUnreachable(u64),

    #[error(transparent)]
    Presence(#[from] PresenceError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Peer(#[from] PeerSessionError),

    #[error(transparent)]
    Call(#[from] CallError),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging
///
/// Einmal pro Prozess aufrufen, bevor der erste `CallService` entsteht.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("matchcall=debug".parse().unwrap())
                .add_directive("webrtc=warn".parse().unwrap()),
        )
        .init();
}

// ============================================================================
// CALL SERVICE
// ============================================================================

/// Fassade über die drei Echtzeit-Subsysteme
///
/// Wird explizit konstruiert und an den Einbettungs-Layer übergeben,
/// es gibt keinen globalen Zustand. Lebenszyklus: `new` → `connect` →
/// Anrufe über start/answer/reject/end → `shutdown`. Nach `shutdown`
/// kann derselbe Service mit `connect` wieder in Betrieb gehen.
pub struct CallService {
    presence: Arc<PresenceChannel>,
    signaling: Arc<SignalingTransport>,
    peer: Arc<PeerSession>,
    manager: Arc<CallSessionManager>,
    user_id: Mutex<Option<u64>>,
}

impl CallService {
    /// Baut den Service aus der Konfiguration
    ///
    /// Schlägt fehl wenn die Dauer-Tabelle die Invarianten verletzt.
    pub fn new(config: AppConfig) -> Result<Self, ServiceError> {
        let schedule = DurationSchedule::from_config(&config.call)?;

        let presence = Arc::new(PresenceChannel::new(config.presence));
        let signaling = Arc::new(SignalingTransport::new(config.signaling));
        let peer = Arc::new(PeerSession::new(Arc::clone(&signaling), config.rtc));
        let manager = Arc::new(CallSessionManager::new(schedule));
        manager.attach_peer(Arc::clone(&peer));

        Ok(Self {
            presence,
            signaling,
            peer,
            manager,
            user_id: Mutex::new(None),
        })
    }

    /// Verbindet beide Kanäle und registriert den Benutzer
    pub async fn connect(&self, user_id: u64) -> Result<(), ServiceError> {
        self.presence.connect(user_id).await?;
        self.signaling.connect(user_id).await?;
        *self.user_id.lock() = Some(user_id);

        tracing::info!("Call service connected as user {}", user_id);
        Ok(())
    }

    /// Opportunistischer Reconnect-Hook
    ///
    /// Vom Einbettungs-Layer aufzurufen wenn die App wieder sichtbar
    /// wird; verbindet den Presence-Kanal neu falls er nicht offen ist.
    pub fn resume(&self) {
        self.presence.ensure_connected();
    }

    /// Prüft ob ein Benutzer aktuell als online bekannt ist
    pub fn is_online(&self, user_id: u64) -> bool {
        self.presence.is_online(user_id)
    }

    /// Startet einen ausgehenden Anruf
    ///
    /// Der Presence-Kanal entscheidet vorab ob die Gegenseite überhaupt
    /// erreichbar ist; danach übernimmt die Anruf-State-Machine.
    pub async fn start_call(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
    ) -> Result<(), ServiceError> {
        let user_id = (*self.user_id.lock()).ok_or(ServiceError::NotConnected)?;

        if !self.presence.is_online(other_user_id) {
            return Err(ServiceError::CalleeUnreachable(other_user_id));
        }

        self.peer.initialize(user_id, true).await?;
        self.manager
            .start_call(match_id, other_user_id, call_day)
            .await?;
        Ok(())
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
    ) -> Result<(), ServiceError> {
        let user_id = (*self.user_id.lock()).ok_or(ServiceError::NotConnected)?;

        self.peer.initialize(user_id, false).await?;
        self.manager
            .answer_call(match_id, other_user_id, call_day)
            .await?;
        Ok(())
    }

    /// Lehnt einen wartenden Anruf ab
    pub async fn reject_call(&self) {
        self.manager.reject_call().await;
    }

    /// Beendet den aktuellen Anruf
    pub async fn end_call(&self) {
        self.manager.end_call().await;
    }

    /// Setzt den Mute-Status des lokalen Tracks
    pub fn set_muted(&self, muted: bool) {
        self.manager.set_muted(muted);
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.manager.is_muted()
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.manager.audio_levels()
    }

    /// Aktuelle Anruf-Phase
    pub fn call_phase(&self) -> CallPhase {
        self.manager.phase()
    }

    /// Aktuelle Session, falls vorhanden
    pub fn current_session(&self) -> Option<CallSession> {
        self.manager.current_session()
    }

    /// Verbleibende Gesprächszeit in Sekunden
    pub fn time_remaining(&self) -> u32 {
        self.manager.time_remaining()
    }

    /// Übernimmt einen neuen Call-Day in eine nicht verbundene Session
    pub fn update_call_day(&self, call_day: u32) {
        self.manager.update_call_day(call_day);
    }

    /// Event-Stream der Anruf-State-Machine
    pub fn subscribe_call_events(&self) -> broadcast::Receiver<CallEvent> {
        self.manager.subscribe()
    }

    /// Event-Stream des Presence-Kanals
    pub fn subscribe_presence_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.presence.subscribe()
    }

    /// Baut den Service vollständig ab
    ///
    /// Beendet einen laufenden Anruf, gibt das Capture-Gerät frei und
    /// schließt beide Kanäle sauber. Idempotent.
    pub async fn shutdown(&self) {
        self.manager.end_call().await;
        self.peer.cleanup().await;
        self.signaling.disconnect().await;
        self.presence.disconnect().await;
        *self.user_id.lock() = None;

        tracing::info!("Call service shut down");
    }
}

impl std::fmt::Debug for CallService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallService")
            .field("user_id", &*self.user_id.lock())
            .field("call_phase", &self.call_phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallPolicyConfig, DurationStep};

    #[test]
    fn test_service_builds_from_default_config() {
        let service = CallService::new(AppConfig::default()).unwrap();
        assert_eq!(service.call_phase(), CallPhase::Idle);
        assert_eq!(service.time_remaining(), 0);
        assert!(!service.is_online(23));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        let mut config = AppConfig::default();
        config.call = CallPolicyConfig {
            schedule: vec![DurationStep { from_day: 1, seconds: 0 }],
        };
        assert!(matches!(
            CallService::new(config),
            Err(ServiceError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_start_call_requires_connect() {
        let service = CallService::new(AppConfig::default()).unwrap();
        let result = service.start_call(7, 42, 1).await;
        assert!(matches!(result, Err(ServiceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_start_call_checks_presence_first() {
        let service = CallService::new(AppConfig::default()).unwrap();
        *service.user_id.lock() = Some(23);

        // Gegenseite ist nicht online: der Anrufversuch endet vor der
        // Initialisierung der Peer Session
        let result = service.start_call(7, 42, 1).await;
        assert!(matches!(result, Err(ServiceError::CalleeUnreachable(42))));
        assert_eq!(service.call_phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_without_connect_is_safe() {
        let service = CallService::new(AppConfig::default()).unwrap();
        service.shutdown().await;
        service.shutdown().await;
        assert_eq!(service.call_phase(), CallPhase::Idle);
    }
}
