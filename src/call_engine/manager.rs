//! Call Session Manager - die Anruf-State-Machine
//!
//! Kapselt eine Peer Session hinter den Phasen
//! Idle → Connecting → Ringing → Connected → Ended, wendet die
//! Dauer-Policy an und bietet die expliziten Operationen
//! start/answer/reject/end plus Mute an. Fehler erzwingen immer den
//! Übergang nach Ended mit einem maschinenlesbaren Grund, nie einen
//! undefinierten Zustand.

use super::peer::{PeerEvent, PeerPhase, PeerSession, PeerSessionError};
use super::policy::{Countdown, CountdownEvent, DurationSchedule};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Peer session is not initialized")]
    NotInitialized,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Peer session error: {0}")]
    Peer(#[from] PeerSessionError),
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Phase eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Connecting,
    Ringing,
    Connected,
    Ended,
}

/// Maschinenlesbarer Grund für das Ende eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    UserEnded,
    TimeExpired,
    NegotiationTimeout,
    Rejected,
    PeerLeft,
    ConnectionFailed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::UserEnded => "user-ended",
            EndReason::TimeExpired => "time-expired",
            EndReason::NegotiationTimeout => "negotiation-timeout",
            EndReason::Rejected => "rejected",
            EndReason::PeerLeft => "peer-left",
            EndReason::ConnectionFailed => "connection-failed",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events die vom CallSessionManager ausgelöst werden
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Phasen-Übergang; `reason` ist nur beim Übergang nach Ended gesetzt
    StateChanged {
        phase: CallPhase,
        reason: Option<EndReason>,
    },

    /// Eine Sekunde Gesprächszeit ist verstrichen
    Tick { remaining_seconds: u32 },
}

/// Zustand eines Anrufs
#[derive(Debug, Clone)]
pub struct CallSession {
    pub match_id: u64,
    pub other_user_id: u64,
    pub call_day: u32,
    pub phase: CallPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub allowed_duration_seconds: u32,
    pub remaining_seconds: u32,
}

struct ManagerState {
    session: Option<CallSession>,
    /// Wird pro Anrufversuch erhöht; Tasks einer beendeten Session
    /// erkennen sich daran als veraltet
    generation: u64,
    as_caller: bool,
    peer_connected: bool,
    remote_stream_seen: bool,
    muted: bool,
}

/// Von allen Tasks geteilter Zustand des Managers
#[derive(Clone)]
struct ManagerShared {
    schedule: Arc<DurationSchedule>,
    peer: Arc<Mutex<Option<Arc<PeerSession>>>>,
    state: Arc<Mutex<ManagerState>>,
    event_tx: broadcast::Sender<CallEvent>,
    countdown: Arc<Mutex<Option<Countdown>>>,
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Anruf-State-Machine über einer Peer Session
pub struct CallSessionManager {
    shared: ManagerShared,
}

impl CallSessionManager {
    /// Erstellt einen neuen Manager mit validierter Dauer-Tabelle
    pub fn new(schedule: DurationSchedule) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: ManagerShared {
                schedule: Arc::new(schedule),
                peer: Arc::new(Mutex::new(None)),
                state: Arc::new(Mutex::new(ManagerState {
                    session: None,
                    generation: 0,
                    as_caller: false,
                    peer_connected: false,
                    remote_stream_seen: false,
                    muted: false,
                })),
                event_tx,
                countdown: Arc::new(Mutex::new(None)),
            },
        }
    }

    /// Hängt die Peer Session ein, über die Anrufe laufen
    pub fn attach_peer(&self, peer: Arc<PeerSession>) {
        *self.shared.peer.lock() = Some(peer);
    }

    /// Gibt einen Event-Receiver zurück
    ///
    /// Alle Receiver sehen jeden Phasen-Übergang, in Anmeldereihenfolge.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Aktuelle Anruf-Phase
    pub fn phase(&self) -> CallPhase {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(CallPhase::Idle)
    }

    /// Aktuelle Session, falls vorhanden
    pub fn current_session(&self) -> Option<CallSession> {
        self.shared.state.lock().session.clone()
    }

    /// Verbleibende Gesprächszeit in Sekunden
    pub fn time_remaining(&self) -> u32 {
        self.shared
            .state
            .lock()
            .session
            .as_ref()
            .map(|s| s.remaining_seconds)
            .unwrap_or(0)
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
    ) -> Result<(), CallError> {
        self.begin(match_id, other_user_id, call_day, true).await
    }

    /// Nimmt einen eingehenden Anruf an
    pub async fn answer_call(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
    ) -> Result<(), CallError> {
        self.begin(match_id, other_user_id, call_day, false).await
    }

    /// Lehnt einen wartenden Anruf ab
    ///
    /// Nur in Connecting oder Ringing wirksam, sonst ein No-Op.
    pub async fn reject_call(&self) {
        let gen = {
            let state = self.shared.state.lock();
            match state.session.as_ref() {
                Some(s) if matches!(s.phase, CallPhase::Connecting | CallPhase::Ringing) => {
                    state.generation
                }
                _ => return,
            }
        };

        self.shared
            .notify_peer(Some(EndReason::Rejected.as_str().to_string()))
            .await;
        self.shared.end_with_reason(gen, EndReason::Rejected).await;
    }

    /// Beendet den aktuellen Anruf
    pub async fn end_call(&self) {
        let gen = {
            let state = self.shared.state.lock();
            match state.session.as_ref() {
                Some(s) if s.phase != CallPhase::Idle && s.phase != CallPhase::Ended => {
                    state.generation
                }
                _ => return,
            }
        };

        self.shared
            .notify_peer(Some(EndReason::UserEnded.as_str().to_string()))
            .await;
        self.shared.end_with_reason(gen, EndReason::UserEnded).await;
    }

    /// Setzt den Mute-Status des lokalen Tracks
    ///
    /// Ohne lokalen Stream ein No-Op, die UI darf defensiv aufrufen.
    pub fn set_muted(&self, muted: bool) {
        let peer = self.shared.peer.lock().clone();
        if let Some(peer) = peer {
            if peer.has_local_stream() {
                peer.set_audio_enabled(!muted);
                self.shared.state.lock().muted = muted;
            }
        }
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.shared.state.lock().muted
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.shared
            .peer
            .lock()
            .as_ref()
            .map(|p| p.audio_levels())
            .unwrap_or((0.0, 0.0))
    }

    /// Übernimmt einen neuen Call-Day in eine nicht verbundene Session
    ///
    /// Die verbleibende Dauer wird neu berechnet; ein laufendes Gespräch
    /// bleibt unberührt.
    pub fn update_call_day(&self, call_day: u32) {
        let mut state = self.shared.state.lock();
        if let Some(session) = state.session.as_mut() {
            if session.phase != CallPhase::Connected {
                let allowed = self.shared.schedule.allowed_duration_seconds(call_day);
                session.call_day = call_day;
                session.allowed_duration_seconds = allowed;
                session.remaining_seconds = allowed;
            }
        }
    }

    /// Gemeinsamer Pfad für start_call und answer_call
    async fn begin(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
        as_caller: bool,
    ) -> Result<(), CallError> {
        let peer = self
            .shared
            .peer
            .lock()
            .clone()
            .ok_or(CallError::NotInitialized)?;
        if !peer.is_initialized() {
            return Err(CallError::NotInitialized);
        }

        let gen = self
            .shared
            .install_session(match_id, other_user_id, call_day, as_caller)?;

        // Peer-Events dieser Session konsumieren
        let mut peer_rx = peer.subscribe();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                match peer_rx.recv().await {
                    Ok(event) => {
                        if shared.state.lock().generation != gen {
                            break;
                        }
                        shared.handle_peer_event(gen, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Call manager lagged {} peer events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let room_id = format!("match-{}", match_id);
        match peer.join_room(&room_id).await {
            Ok(participants) => {
                tracing::info!(
                    "Joined call room {} with {} other participant(s)",
                    room_id,
                    participants.len()
                );
                if as_caller {
                    // Anrufer wartet ab hier darauf, dass abgenommen wird
                    self.shared.transition_to_ringing(gen);
                }
                Ok(())
            }
            Err(e) => {
                // Join nicht bestätigt: deterministisch beenden statt in
                // Connecting hängen zu bleiben
                self.shared
                    .end_with_reason(gen, EndReason::NegotiationTimeout)
                    .await;
                Err(CallError::Peer(e))
            }
        }
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("phase", &self.phase())
            .field("time_remaining", &self.time_remaining())
            .field("is_muted", &self.is_muted())
            .finish()
    }
}

// ============================================================================
// STATE TRANSITIONS
// ============================================================================

impl ManagerShared {
    /// Legt eine frische Session in Connecting an
    fn install_session(
        &self,
        match_id: u64,
        other_user_id: u64,
        call_day: u32,
        as_caller: bool,
    ) -> Result<u64, CallError> {
        let gen = {
            let mut state = self.state.lock();
            if matches!(
                state.session.as_ref().map(|s| s.phase),
                Some(CallPhase::Connecting | CallPhase::Ringing | CallPhase::Connected)
            ) {
                return Err(CallError::AlreadyInCall);
            }

            state.generation += 1;
            state.as_caller = as_caller;
            state.peer_connected = false;
            state.remote_stream_seen = false;
            state.muted = false;

            let allowed = self.schedule.allowed_duration_seconds(call_day);
            state.session = Some(CallSession {
                match_id,
                other_user_id,
                call_day,
                phase: CallPhase::Connecting,
                started_at: None,
                allowed_duration_seconds: allowed,
                remaining_seconds: allowed,
            });
            state.generation
        };

        let _ = self.event_tx.send(CallEvent::StateChanged {
            phase: CallPhase::Connecting,
            reason: None,
        });
        tracing::info!(
            "Call session created for match {} (day {}, {})",
            match_id,
            call_day,
            if as_caller { "caller" } else { "callee" }
        );

        Ok(gen)
    }

    /// Connecting → Ringing, nur auf der Anrufer-Seite
    fn transition_to_ringing(&self, gen: u64) {
        let changed = {
            let mut state = self.state.lock();
            if state.generation != gen {
                false
            } else {
                match state.session.as_mut() {
                    Some(session) if session.phase == CallPhase::Connecting => {
                        session.phase = CallPhase::Ringing;
                        true
                    }
                    _ => false,
                }
            }
        };

        if changed {
            let _ = self.event_tx.send(CallEvent::StateChanged {
                phase: CallPhase::Ringing,
                reason: None,
            });
        }
    }

    /// Verarbeitet ein Peer-Event dieser Session
    async fn handle_peer_event(&self, gen: u64, event: PeerEvent) {
        match event {
            PeerEvent::PhaseChanged(PeerPhase::Connected) => {
                {
                    let mut state = self.state.lock();
                    if state.generation == gen {
                        state.peer_connected = true;
                    }
                }
                self.maybe_connected(gen);
            }

            PeerEvent::RemoteStreamAdded => {
                {
                    let mut state = self.state.lock();
                    if state.generation == gen {
                        state.remote_stream_seen = true;
                    }
                }
                self.maybe_connected(gen);
            }

            PeerEvent::PhaseChanged(PeerPhase::Failed) => {
                self.end_with_reason(gen, EndReason::ConnectionFailed).await;
            }

            PeerEvent::NegotiationTimeout => {
                self.end_with_reason(gen, EndReason::NegotiationTimeout)
                    .await;
            }

            PeerEvent::PhaseChanged(PeerPhase::Disconnected) => {
                // transient, kann sich ohne Renegotiation erholen
                tracing::warn!("Peer connection lost, waiting for recovery");
            }

            PeerEvent::PhaseChanged(PeerPhase::Closed) => {
                // beim eigenen Abbau längst Ended; sonst ein fataler Abbruch
                self.end_with_reason(gen, EndReason::ConnectionFailed).await;
            }

            PeerEvent::ParticipantLeft { user_id } => {
                tracing::info!("Participant {} left the call room", user_id);
                self.end_with_reason(gen, EndReason::PeerLeft).await;
            }

            PeerEvent::Bye { reason } => {
                let connected = {
                    let state = self.state.lock();
                    matches!(
                        state.session.as_ref().map(|s| s.phase),
                        Some(CallPhase::Connected)
                    )
                };
                let end_reason = match reason.as_deref() {
                    Some("rejected") => EndReason::Rejected,
                    Some(_) => EndReason::PeerLeft,
                    None if connected => EndReason::PeerLeft,
                    None => EndReason::Rejected,
                };
                self.end_with_reason(gen, end_reason).await;
            }

            PeerEvent::SignalingLost { reason } => {
                let pre_connect = {
                    let state = self.state.lock();
                    matches!(
                        state.session.as_ref().map(|s| s.phase),
                        Some(CallPhase::Connecting | CallPhase::Ringing)
                    )
                };
                if pre_connect {
                    tracing::warn!("Signaling lost before connect: {}", reason);
                    self.end_with_reason(gen, EndReason::ConnectionFailed).await;
                }
                // ein verbundener Anruf läuft ohne Signaling weiter
            }

            PeerEvent::PhaseChanged(_)
            | PeerEvent::RoomJoined { .. }
            | PeerEvent::ParticipantJoined { .. }
            | PeerEvent::IceStateChange { .. }
            | PeerEvent::ConnectionStateChange { .. } => {}
        }
    }

    /// Ringing/Connecting → Connected sobald die Verbindung steht und
    /// beide Streams da sind; startet den Dauer-Countdown
    fn maybe_connected(&self, gen: u64) {
        let local_ok = self
            .peer
            .lock()
            .as_ref()
            .map(|p| p.has_local_stream())
            .unwrap_or(true);

        let allowed = {
            let mut state = self.state.lock();
            if state.generation != gen
                || !state.peer_connected
                || !state.remote_stream_seen
                || !local_ok
            {
                None
            } else {
                match state.session.as_mut() {
                    Some(session)
                        if matches!(session.phase, CallPhase::Connecting | CallPhase::Ringing) =>
                    {
                        session.phase = CallPhase::Connected;
                        session.started_at = Some(Utc::now());
                        session.remaining_seconds = session.allowed_duration_seconds;
                        Some(session.allowed_duration_seconds)
                    }
                    _ => None,
                }
            }
        };

        let allowed = match allowed {
            Some(allowed) => allowed,
            None => return,
        };

        let _ = self.event_tx.send(CallEvent::StateChanged {
            phase: CallPhase::Connected,
            reason: None,
        });
        tracing::info!("Call connected, {} seconds allowed", allowed);

        // Countdown für die erlaubte Gesprächsdauer
        let (tick_tx, mut tick_rx) = mpsc::channel(8);
        *self.countdown.lock() = Some(Countdown::start(allowed, tick_tx));

        let shared = self.clone();
        tokio::spawn(async move {
            while let Some(event) = tick_rx.recv().await {
                match event {
                    CountdownEvent::Tick { remaining } => {
                        let current = {
                            let mut state = shared.state.lock();
                            if state.generation != gen {
                                false
                            } else {
                                match state.session.as_mut() {
                                    Some(session) if session.phase == CallPhase::Connected => {
                                        session.remaining_seconds = remaining;
                                        true
                                    }
                                    _ => false,
                                }
                            }
                        };
                        if !current {
                            break;
                        }
                        let _ = shared.event_tx.send(CallEvent::Tick {
                            remaining_seconds: remaining,
                        });
                    }
                    CountdownEvent::Expired => {
                        shared
                            .notify_peer(Some(EndReason::TimeExpired.as_str().to_string()))
                            .await;
                        shared.end_with_reason(gen, EndReason::TimeExpired).await;
                        break;
                    }
                }
            }
        });
    }

    /// Meldet der Gegenseite das Ende, Best-Effort
    async fn notify_peer(&self, reason: Option<String>) {
        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            if let Err(e) = peer.send_bye(reason).await {
                tracing::debug!("Could not notify peer about call end: {}", e);
            }
        }
    }

    /// Erzwingt den Übergang nach Ended und räumt die Session ab
    ///
    /// Genau einmal wirksam pro Session; veraltete Generationen und
    /// bereits beendete Sessions sind ein No-Op.
    async fn end_with_reason(&self, gen: u64, reason: EndReason) {
        let proceed = {
            let mut state = self.state.lock();
            if state.generation != gen {
                false
            } else {
                match state.session.as_mut() {
                    Some(session) if session.phase != CallPhase::Ended => {
                        session.phase = CallPhase::Ended;
                        if reason == EndReason::TimeExpired {
                            session.remaining_seconds = 0;
                        }
                        true
                    }
                    _ => false,
                }
            }
        };
        if !proceed {
            return;
        }

        if let Some(mut countdown) = self.countdown.lock().take() {
            countdown.cancel();
        }

        let _ = self.event_tx.send(CallEvent::StateChanged {
            phase: CallPhase::Ended,
            reason: Some(reason),
        });
        tracing::info!("Call ended: {}", reason);

        let peer = self.peer.lock().clone();
        if let Some(peer) = peer {
            peer.cleanup().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collect_phases(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallPhase> {
        let mut phases = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(CallEvent::StateChanged { phase, .. }) => phases.push(phase),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        phases
    }

    #[tokio::test]
    async fn test_start_call_without_peer_fails() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let result = manager.start_call(7, 42, 1).await;
        assert!(matches!(result, Err(CallError::NotInitialized)));
        assert_eq!(manager.phase(), CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_second_session_while_active_is_rejected() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        manager.shared.install_session(7, 42, 1, true).unwrap();

        let result = manager.shared.install_session(8, 43, 1, true);
        assert!(matches!(result, Err(CallError::AlreadyInCall)));
    }

    #[tokio::test]
    async fn test_caller_phase_sequence() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager.shared.transition_to_ringing(gen);
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::RemoteStreamAdded)
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::PhaseChanged(PeerPhase::Connected))
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::ParticipantLeft { user_id: 42 })
            .await;

        assert_eq!(
            collect_phases(&mut rx),
            vec![
                CallPhase::Connecting,
                CallPhase::Ringing,
                CallPhase::Connected,
                CallPhase::Ended,
            ]
        );
    }

    #[tokio::test]
    async fn test_callee_skips_ringing() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, false).unwrap();
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::PhaseChanged(PeerPhase::Connected))
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::RemoteStreamAdded)
            .await;

        assert_eq!(manager.phase(), CallPhase::Connected);
        assert_eq!(
            collect_phases(&mut rx),
            vec![CallPhase::Connecting, CallPhase::Connected]
        );
    }

    #[tokio::test]
    async fn test_negotiation_timeout_forces_ended() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::NegotiationTimeout)
            .await;

        // nicht in Connecting hängen geblieben
        assert_eq!(manager.phase(), CallPhase::Ended);

        let mut saw_reason = None;
        loop {
            match rx.try_recv() {
                Ok(CallEvent::StateChanged {
                    phase: CallPhase::Ended,
                    reason,
                }) => saw_reason = reason,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(saw_reason, Some(EndReason::NegotiationTimeout));
    }

    #[tokio::test]
    async fn test_remote_bye_before_connect_is_rejection() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager
            .shared
            .handle_peer_event(
                gen,
                PeerEvent::Bye {
                    reason: Some("rejected".to_string()),
                },
            )
            .await;

        assert_eq!(manager.phase(), CallPhase::Ended);
        let mut reasons = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(CallEvent::StateChanged {
                    reason: Some(reason),
                    ..
                }) => reasons.push(reason),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(reasons, vec![EndReason::Rejected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_call_expires_after_allowed_duration() {
        // Szenario: callDay 1 erlaubt 300 Sekunden; bei t=300 endet der
        // Anruf automatisch mit time-expired und remaining == 0
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager.shared.transition_to_ringing(gen);
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::RemoteStreamAdded)
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::PhaseChanged(PeerPhase::Connected))
            .await;

        assert_eq!(manager.phase(), CallPhase::Connected);
        assert_eq!(manager.time_remaining(), 300);

        // die pausierte Test-Uhr springt über die gesamte Gesprächsdauer
        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(manager.phase(), CallPhase::Ended);
        assert_eq!(manager.time_remaining(), 0);

        // genau ein Ended-Event, Grund time-expired
        let mut ended = 0;
        loop {
            match rx.try_recv() {
                Ok(CallEvent::StateChanged {
                    phase: CallPhase::Ended,
                    reason,
                }) => {
                    ended += 1;
                    assert_eq!(reason, Some(EndReason::TimeExpired));
                }
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_seconds_decrease_while_connected() {
        let manager = CallSessionManager::new(DurationSchedule::default());

        let gen = manager.shared.install_session(7, 42, 1, false).unwrap();
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::PhaseChanged(PeerPhase::Connected))
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::RemoteStreamAdded)
            .await;

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        // nach gut zehn Sekunden sind genau zehn Sekunden verbraucht
        assert_eq!(manager.time_remaining(), 290);
        assert_eq!(manager.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_end_call_when_idle_is_noop() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        manager.end_call().await;
        manager.reject_call().await;

        assert_eq!(manager.phase(), CallPhase::Idle);
        assert!(collect_phases(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stale_generation_cannot_end_new_session() {
        let manager = CallSessionManager::new(DurationSchedule::default());

        let old_gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager
            .shared
            .end_with_reason(old_gen, EndReason::UserEnded)
            .await;

        let _new_gen = manager.shared.install_session(7, 42, 2, true).unwrap();

        // Event der alten Session darf die neue nicht beenden
        manager
            .shared
            .handle_peer_event(old_gen, PeerEvent::ParticipantLeft { user_id: 42 })
            .await;
        assert_eq!(manager.phase(), CallPhase::Connecting);
    }

    #[tokio::test]
    async fn test_double_end_emits_single_ended_event() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        let mut rx = manager.subscribe();

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager
            .shared
            .end_with_reason(gen, EndReason::UserEnded)
            .await;
        manager
            .shared
            .end_with_reason(gen, EndReason::ConnectionFailed)
            .await;

        let ended = collect_phases(&mut rx)
            .into_iter()
            .filter(|p| *p == CallPhase::Ended)
            .count();
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_update_call_day_resets_pending_duration() {
        let manager = CallSessionManager::new(DurationSchedule::default());

        manager.shared.install_session(7, 42, 1, true).unwrap();
        assert_eq!(manager.time_remaining(), 300);

        // neuer Tag vor dem Verbinden: Dauer wird neu berechnet
        manager.update_call_day(3);
        assert_eq!(manager.time_remaining(), 900);
        assert_eq!(manager.current_session().unwrap().call_day, 3);
    }

    #[tokio::test]
    async fn test_update_call_day_ignored_while_connected() {
        let manager = CallSessionManager::new(DurationSchedule::default());

        let gen = manager.shared.install_session(7, 42, 1, false).unwrap();
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::PhaseChanged(PeerPhase::Connected))
            .await;
        manager
            .shared
            .handle_peer_event(gen, PeerEvent::RemoteStreamAdded)
            .await;
        assert_eq!(manager.phase(), CallPhase::Connected);

        manager.update_call_day(7);
        assert_eq!(manager.current_session().unwrap().call_day, 1);
        assert_eq!(
            manager.current_session().unwrap().allowed_duration_seconds,
            300
        );
    }

    #[tokio::test]
    async fn test_mute_without_stream_is_noop() {
        let manager = CallSessionManager::new(DurationSchedule::default());
        manager.set_muted(true);
        assert!(!manager.is_muted());
        assert_eq!(manager.audio_levels(), (0.0, 0.0));
    }

    #[tokio::test]
    async fn test_new_call_after_ended_starts_fresh_session() {
        let manager = CallSessionManager::new(DurationSchedule::default());

        let gen = manager.shared.install_session(7, 42, 1, true).unwrap();
        manager
            .shared
            .end_with_reason(gen, EndReason::UserEnded)
            .await;
        assert_eq!(manager.phase(), CallPhase::Ended);

        // Ended → Connecting über einen neuen Versuch
        manager.shared.install_session(7, 42, 2, true).unwrap();
        let session = manager.current_session().unwrap();
        assert_eq!(session.phase, CallPhase::Connecting);
        assert_eq!(session.call_day, 2);
        assert_eq!(session.allowed_duration_seconds, 600);
        assert!(session.started_at.is_none());
    }
}
