//! Peer Session - eine P2P-Audioverbindung
//!
//! Besitzt genau eine WebRTC Peer Connection, treibt sie durch die
//! Phasen-Maschine New → Negotiating → Connected (→ Disconnected /
//! Failed) → Closed und vermittelt lokale und entfernte Streams.
//! Negotiation-Nachrichten laufen über den Signaling-Transport,
//! ICE-Kandidaten werden einzeln verschickt sobald sie anfallen
//! (Trickle-ICE).

use super::media::{MediaHandle, SAMPLE_RATE};
use crate::config::RtcConfig;
use crate::signaling::{Signal, SignalingError, SignalingEvent, SignalingTransport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerSessionError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Device access failed: {0}")]
    DeviceAccess(#[from] super::media::MediaError),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Peer session is not initialized")]
    NotInitialized,

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// PEER STATE
// ============================================================================

/// Phase der Peer-Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    New,
    Negotiating,
    Connected,
    /// Transienter Verbindungsverlust, kann sich ohne Renegotiation erholen
    Disconnected,
    Failed,
    Closed,
}

/// Events die von der PeerSession ausgelöst werden
///
/// Raum-Events des Transports werden weitergereicht, die
/// Verbindungs-Zustände der Peer Connection kommen ergänzend dazu.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    PhaseChanged(PeerPhase),

    RoomJoined { participants: Vec<u64> },

    ParticipantJoined { user_id: u64 },

    ParticipantLeft { user_id: u64 },

    /// Die Gegenseite liefert einen Media-Track
    RemoteStreamAdded,

    IceStateChange { state: String },

    ConnectionStateChange { state: String },

    /// Die Negotiation hat die konfigurierte Obergrenze überschritten
    NegotiationTimeout,

    /// Der Signaling-Transport hat die Verbindung verloren
    SignalingLost { reason: String },

    /// Abschied der Gegenseite (Ablehnung oder Auflegen)
    Bye { reason: Option<String> },
}

struct PeerState {
    phase: PeerPhase,
    ice_state: String,
    is_caller: bool,
    local_user_id: Option<u64>,
    offer_sent: bool,
}

/// Von allen Tasks und Handlern geteilter Zustand
#[derive(Clone)]
struct PeerShared {
    transport: Arc<SignalingTransport>,
    config: RtcConfig,
    state: Arc<Mutex<PeerState>>,
    pc: Arc<Mutex<Option<Arc<RTCPeerConnection>>>>,
    media: Arc<Mutex<Option<MediaHandle>>>,
    event_tx: broadcast::Sender<PeerEvent>,
    /// Wird bei initialize() und cleanup() erhöht; Timer und Handler
    /// einer abgelösten Session erkennen sich daran als veraltet
    generation: Arc<AtomicU64>,
}

// ============================================================================
// PEER SESSION
// ============================================================================

/// Eine P2P-Audioverbindung zu genau einer Gegenseite
pub struct PeerSession {
    shared: PeerShared,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    /// Erstellt eine neue, noch nicht initialisierte Session
    pub fn new(transport: Arc<SignalingTransport>, config: RtcConfig) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            shared: PeerShared {
                transport,
                config,
                state: Arc::new(Mutex::new(PeerState {
                    phase: PeerPhase::New,
                    ice_state: "new".to_string(),
                    is_caller: false,
                    local_user_id: None,
                    offer_sent: false,
                })),
                pc: Arc::new(Mutex::new(None)),
                media: Arc::new(Mutex::new(None)),
                event_tx,
                generation: Arc::new(AtomicU64::new(0)),
            },
            pump_task: Mutex::new(None),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Aktuelle Phase der Peer-Verbindung
    pub fn phase(&self) -> PeerPhase {
        self.shared.state.lock().phase
    }

    /// Letzter gemeldeter ICE-Zustand
    pub fn ice_state(&self) -> String {
        self.shared.state.lock().ice_state.clone()
    }

    /// Prüft ob die Session initialisiert ist
    pub fn is_initialized(&self) -> bool {
        self.shared.pc.lock().is_some()
    }

    /// Prüft ob ein lokaler Capture-Stream existiert
    pub fn has_local_stream(&self) -> bool {
        self.shared.media.lock().is_some()
    }

    /// Schaltet den lokalen Capture-Track ein oder aus
    ///
    /// Ohne lokalen Stream ein No-Op.
    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(media) = self.shared.media.lock().as_ref() {
            media.set_enabled(enabled);
        }
    }

    /// Gibt zurück ob der lokale Capture-Track aktiv ist
    pub fn is_audio_enabled(&self) -> bool {
        self.shared
            .media
            .lock()
            .as_ref()
            .map(|m| m.is_enabled())
            .unwrap_or(false)
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn audio_levels(&self) -> (f32, f32) {
        self.shared
            .media
            .lock()
            .as_ref()
            .map(|m| m.levels())
            .unwrap_or((0.0, 0.0))
    }

    /// Initialisiert die Session für einen Anrufversuch
    ///
    /// Fordert das Audio-Gerät an (schlägt sofort fehl wenn der Zugriff
    /// verweigert wird), baut die Peer Connection auf und beginnt die
    /// Transport-Events zu konsumieren.
    pub async fn initialize(
        &self,
        local_user_id: u64,
        is_caller: bool,
    ) -> Result<(), PeerSessionError> {
        if self.shared.pc.lock().is_some() {
            // Reste einer früheren Session abbauen
            self.cleanup().await;
        }

        let gen = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Audio-Gerät anfordern, nur Audio
        let media = MediaHandle::open()?;
        *self.shared.media.lock() = Some(media);

        {
            let mut state = self.shared.state.lock();
            state.phase = PeerPhase::New;
            state.ice_state = "new".to_string();
            state.is_caller = is_caller;
            state.local_user_id = Some(local_user_id);
            state.offer_sent = false;
        }

        let pc = self.shared.create_peer_connection(gen).await?;
        *self.shared.pc.lock() = Some(pc);

        // Transport-Events für diese Session konsumieren
        let mut rx = self.shared.transport.subscribe();
        let shared = self.shared.clone();
        let pump = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if shared.generation.load(Ordering::SeqCst) != gen {
                            break;
                        }
                        shared.handle_signaling_event(gen, event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Peer session lagged {} signaling events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.pump_task.lock() = Some(pump);

        let _ = self.shared.event_tx.send(PeerEvent::PhaseChanged(PeerPhase::New));
        tracing::info!(
            "Peer session initialized for user {} as {}",
            local_user_id,
            if is_caller { "caller" } else { "callee" }
        );

        Ok(())
    }

    /// Tritt dem Signaling-Raum des Anrufs bei
    ///
    /// Das Offer wird event-getrieben erstellt, sobald der Anrufer eine
    /// Gegenseite im Raum sieht.
    pub async fn join_room(&self, room_id: &str) -> Result<Vec<u64>, PeerSessionError> {
        if !self.is_initialized() {
            return Err(PeerSessionError::NotInitialized);
        }
        let participants = self.shared.transport.join_room(room_id).await?;
        Ok(participants)
    }

    /// Meldet der Gegenseite einen Abschied (Ablehnung oder Auflegen)
    pub async fn send_bye(&self, reason: Option<String>) -> Result<(), PeerSessionError> {
        self.shared
            .transport
            .send_signal(Signal::Bye { reason })
            .await?;
        Ok(())
    }

    /// Baut die Session vollständig ab
    ///
    /// Idempotent und aus jeder Phase heraus erlaubt: gibt das
    /// Capture-Gerät frei, schließt die Peer Connection, verlässt den
    /// Raum und entwertet alle noch laufenden Timer dieser Session.
    pub async fn cleanup(&self) {
        // entwertet Negotiation-Timer und späte WebRTC-Callbacks
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(pump) = self.pump_task.lock().take() {
            pump.abort();
        }

        if let Some(mut media) = self.shared.media.lock().take() {
            media.release();
        }

        let pc = self.shared.pc.lock().take();
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                tracing::warn!("Failed to close peer connection: {}", e);
            }
        }

        if let Err(e) = self.shared.transport.leave_room().await {
            tracing::warn!("Failed to leave room during cleanup: {}", e);
        }

        let changed = {
            let mut state = self.shared.state.lock();
            if state.phase == PeerPhase::Closed {
                false
            } else {
                state.phase = PeerPhase::Closed;
                true
            }
        };
        if changed {
            let _ = self
                .shared
                .event_tx
                .send(PeerEvent::PhaseChanged(PeerPhase::Closed));
        }

        tracing::info!("Peer session cleaned up");
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("PeerSession")
            .field("phase", &state.phase)
            .field("ice_state", &state.ice_state)
            .field("is_caller", &state.is_caller)
            .finish()
    }
}

// ============================================================================
// NEGOTIATION
// ============================================================================

impl PeerShared {
    /// Erstellt die Peer Connection mit Audio-Track und Handlern
    async fn create_peer_connection(
        &self,
        gen: u64,
    ) -> Result<Arc<RTCPeerConnection>, PeerSessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?,
        );

        // Lokaler Audio-Track
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "matchcall".to_string(),
        ));

        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        self.register_handlers(gen, Arc::clone(&pc));

        Ok(pc)
    }

    /// STUN/TURN-Server aus der Konfiguration
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone(),
                credential: server.credential.clone(),
                ..Default::default()
            })
            .collect()
    }

    /// Registriert die WebRTC Event-Handler
    fn register_handlers(&self, gen: u64, pc: Arc<RTCPeerConnection>) {
        // Connection State → Phase
        let shared = self.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            if shared.generation.load(Ordering::SeqCst) == gen {
                let _ = shared.event_tx.send(PeerEvent::ConnectionStateChange {
                    state: format!("{:?}", s),
                });

                let phase = match s {
                    RTCPeerConnectionState::Connected => Some(PeerPhase::Connected),
                    RTCPeerConnectionState::Disconnected => Some(PeerPhase::Disconnected),
                    RTCPeerConnectionState::Failed => Some(PeerPhase::Failed),
                    RTCPeerConnectionState::Closed => Some(PeerPhase::Closed),
                    _ => None,
                };
                if let Some(phase) = phase {
                    shared.apply_phase(gen, phase);
                }
            }

            Box::pin(async {})
        }));

        // ICE State
        let shared = self.clone();
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            tracing::debug!("ICE connection state: {:?}", s);

            if shared.generation.load(Ordering::SeqCst) == gen {
                let state = format!("{:?}", s);
                shared.state.lock().ice_state = state.clone();
                let _ = shared.event_tx.send(PeerEvent::IceStateChange { state });
            }

            Box::pin(async {})
        }));

        // Lokale ICE Candidates einzeln verschicken (Trickle-ICE)
        let shared = self.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let shared = shared.clone();
            Box::pin(async move {
                if shared.generation.load(Ordering::SeqCst) != gen {
                    return;
                }
                if let Some(c) = candidate {
                    if let Ok(json) = c.to_json() {
                        if let Ok(payload) = serde_json::to_string(&json) {
                            if let Err(e) = shared
                                .transport
                                .send_signal(Signal::Candidate { candidate: payload })
                                .await
                            {
                                tracing::warn!("Failed to send ICE candidate: {}", e);
                            }
                        }
                    }
                }
            })
        }));

        // Remote Track
        let shared = self.clone();
        pc.on_track(Box::new(move |track, _, _| {
            let shared = shared.clone();
            Box::pin(async move {
                if shared.generation.load(Ordering::SeqCst) != gen {
                    return;
                }
                tracing::info!("Received remote track: {:?}", track.codec());
                let _ = shared.event_tx.send(PeerEvent::RemoteStreamAdded);
            })
        }));
    }

    /// Verarbeitet ein Transport-Event dieser Session
    async fn handle_signaling_event(&self, gen: u64, event: SignalingEvent) {
        match event {
            SignalingEvent::RoomJoined { participants, .. } => {
                let _ = self.event_tx.send(PeerEvent::RoomJoined {
                    participants: participants.clone(),
                });
                // Anrufer erstellt das Offer sobald die Gegenseite da ist
                if !participants.is_empty() && self.claim_offer_role() {
                    self.run_caller_negotiation(gen).await;
                }
            }

            SignalingEvent::ParticipantJoined { user_id } => {
                let _ = self.event_tx.send(PeerEvent::ParticipantJoined { user_id });
                if self.claim_offer_role() {
                    self.run_caller_negotiation(gen).await;
                }
            }

            SignalingEvent::ParticipantLeft { user_id } => {
                let _ = self.event_tx.send(PeerEvent::ParticipantLeft { user_id });
            }

            SignalingEvent::Offer { sdp } => {
                if let Err(e) = self.handle_remote_offer(gen, sdp).await {
                    tracing::error!("Failed to answer offer: {}", e);
                    self.apply_phase(gen, PeerPhase::Failed);
                }
            }

            SignalingEvent::Answer { sdp } => {
                if let Err(e) = self.handle_remote_answer(gen, sdp).await {
                    tracing::error!("Failed to apply answer: {}", e);
                    self.apply_phase(gen, PeerPhase::Failed);
                }
            }

            SignalingEvent::Candidate { candidate } => {
                // Trickle-ICE: empfangene Kandidaten sofort anwenden
                if let Err(e) = self.handle_remote_candidate(candidate).await {
                    tracing::warn!("Failed to apply ICE candidate: {}", e);
                }
            }

            SignalingEvent::Bye { reason } => {
                let _ = self.event_tx.send(PeerEvent::Bye { reason });
            }

            SignalingEvent::Disconnected { reason } => {
                let _ = self.event_tx.send(PeerEvent::SignalingLost { reason });
            }

            SignalingEvent::Error { code, message } => {
                tracing::debug!("Signaling error passed through: {} {}", code, message);
            }

            SignalingEvent::Connecting
            | SignalingEvent::Connected
            | SignalingEvent::Reconnecting { .. } => {}
        }
    }

    /// Genau ein Offer pro Session: nur der Anrufer, nur einmal
    fn claim_offer_role(&self) -> bool {
        let mut state = self.state.lock();
        if state.is_caller && !state.offer_sent {
            state.offer_sent = true;
            true
        } else {
            false
        }
    }

    async fn run_caller_negotiation(&self, gen: u64) {
        if let Err(e) = self.start_negotiation_as_caller(gen).await {
            tracing::error!("Failed to start negotiation: {}", e);
            self.apply_phase(gen, PeerPhase::Failed);
        }
    }

    /// Anrufer-Seite: Offer erstellen und verschicken
    async fn start_negotiation_as_caller(&self, gen: u64) -> Result<(), PeerSessionError> {
        let pc = self
            .pc
            .lock()
            .clone()
            .ok_or(PeerSessionError::NotInitialized)?;

        self.begin_negotiation(gen);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        self.transport
            .send_signal(Signal::Offer { sdp: offer.sdp })
            .await?;

        tracing::info!("Offer sent");
        Ok(())
    }

    /// Angerufenen-Seite: auf das Offer mit einem Answer antworten
    async fn handle_remote_offer(&self, gen: u64, sdp: String) -> Result<(), PeerSessionError> {
        if self.generation.load(Ordering::SeqCst) != gen {
            return Ok(());
        }
        let pc = self
            .pc
            .lock()
            .clone()
            .ok_or(PeerSessionError::NotInitialized)?;

        self.begin_negotiation(gen);

        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| PeerSessionError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        self.transport
            .send_signal(Signal::Answer { sdp: answer.sdp })
            .await?;

        tracing::info!("Answer sent");
        Ok(())
    }

    /// Anrufer-Seite: das Answer der Gegenseite anwenden
    async fn handle_remote_answer(&self, gen: u64, sdp: String) -> Result<(), PeerSessionError> {
        if self.generation.load(Ordering::SeqCst) != gen {
            return Ok(());
        }
        let pc = self
            .pc
            .lock()
            .clone()
            .ok_or(PeerSessionError::NotInitialized)?;

        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| PeerSessionError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(answer)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        Ok(())
    }

    async fn handle_remote_candidate(&self, candidate: String) -> Result<(), PeerSessionError> {
        let pc = self
            .pc
            .lock()
            .clone()
            .ok_or(PeerSessionError::NotInitialized)?;

        let init: RTCIceCandidateInit = serde_json::from_str(&candidate)
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| PeerSessionError::WebRtc(e.to_string()))?;

        Ok(())
    }

    /// Übergang nach Negotiating plus Timer für die gesamte Negotiation
    fn begin_negotiation(&self, gen: u64) {
        let started = {
            let mut state = self.state.lock();
            if state.phase == PeerPhase::New {
                state.phase = PeerPhase::Negotiating;
                true
            } else {
                false
            }
        };
        if !started {
            return;
        }

        let _ = self
            .event_tx
            .send(PeerEvent::PhaseChanged(PeerPhase::Negotiating));

        // Begrenzte Wartezeit statt unbegrenzt hängender Negotiation;
        // nach cleanup() ist der Timer durch den Generation-Check ein No-Op
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(shared.config.negotiation_timeout_secs)).await;

            if shared.generation.load(Ordering::SeqCst) != gen {
                return;
            }
            let timed_out = {
                let state = shared.state.lock();
                matches!(state.phase, PeerPhase::New | PeerPhase::Negotiating)
            };
            if timed_out {
                tracing::warn!("Negotiation timed out");
                shared.apply_phase(gen, PeerPhase::Failed);
                let _ = shared.event_tx.send(PeerEvent::NegotiationTimeout);
            }
        });
    }

    /// Setzt die Phase, sofern die Session noch aktuell ist
    fn apply_phase(&self, gen: u64, phase: PeerPhase) {
        if self.generation.load(Ordering::SeqCst) != gen {
            return;
        }
        let changed = {
            let mut state = self.state.lock();
            if state.phase == phase {
                false
            } else {
                state.phase = phase;
                true
            }
        };
        if changed {
            let _ = self.event_tx.send(PeerEvent::PhaseChanged(phase));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingConfig;

    fn make_session() -> PeerSession {
        let transport = Arc::new(SignalingTransport::new(SignalingConfig::default()));
        PeerSession::new(transport, RtcConfig::default())
    }

    #[test]
    fn test_only_caller_claims_offer_once() {
        let session = make_session();

        // Angerufene Seite erstellt nie ein Offer
        session.shared.state.lock().is_caller = false;
        assert!(!session.shared.claim_offer_role());

        // Anrufer genau einmal
        {
            let mut state = session.shared.state.lock();
            state.is_caller = true;
            state.offer_sent = false;
        }
        assert!(session.shared.claim_offer_role());
        assert!(!session.shared.claim_offer_role());
    }

    #[test]
    fn test_apply_phase_guards_stale_generation() {
        let session = make_session();
        let gen = session.shared.generation.load(Ordering::SeqCst);

        session.shared.apply_phase(gen, PeerPhase::Negotiating);
        assert_eq!(session.phase(), PeerPhase::Negotiating);

        // veraltete Generation darf nichts mehr ändern
        session.shared.generation.fetch_add(1, Ordering::SeqCst);
        session.shared.apply_phase(gen, PeerPhase::Connected);
        assert_eq!(session.phase(), PeerPhase::Negotiating);
    }

    #[test]
    fn test_disconnected_phase_may_recover() {
        let session = make_session();
        let gen = session.shared.generation.load(Ordering::SeqCst);

        session.shared.apply_phase(gen, PeerPhase::Negotiating);
        session.shared.apply_phase(gen, PeerPhase::Connected);
        session.shared.apply_phase(gen, PeerPhase::Disconnected);
        // transienter Verlust kann sich ohne Renegotiation erholen
        session.shared.apply_phase(gen, PeerPhase::Connected);
        assert_eq!(session.phase(), PeerPhase::Connected);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let session = make_session();

        // nie initialisiert: cleanup darf nicht panicken
        session.cleanup().await;
        assert_eq!(session.phase(), PeerPhase::Closed);

        // und ein zweites Mal genauso wenig
        session.cleanup().await;
        assert_eq!(session.phase(), PeerPhase::Closed);
        assert!(!session.is_initialized());
        assert!(!session.has_local_stream());
    }

    #[tokio::test]
    async fn test_join_room_requires_initialization() {
        let session = make_session();
        let result = session.join_room("match-17").await;
        assert!(matches!(result, Err(PeerSessionError::NotInitialized)));
    }

    #[test]
    fn test_mute_without_stream_is_noop() {
        let session = make_session();
        session.set_audio_enabled(false);
        assert!(!session.is_audio_enabled());
        assert_eq!(session.audio_levels(), (0.0, 0.0));
    }
}
