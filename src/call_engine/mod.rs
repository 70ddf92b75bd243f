//! Call Engine Module - Peer Session, Anruf-State-Machine und Dauer-Policy
//!
//! Dieses Modul verwaltet:
//! - die WebRTC Peer Connection samt lokalem Audio
//! - die Anruf-Phasen Idle → Connecting → Ringing → Connected → Ended
//! - die Dauer-Policy mit Countdown

mod manager;
mod media;
mod peer;
mod policy;

pub use manager::{CallError, CallEvent, CallPhase, CallSession, CallSessionManager, EndReason};
pub use media::{MediaError, MediaHandle, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use peer::{PeerEvent, PeerPhase, PeerSession, PeerSessionError};
pub use policy::{DurationSchedule, PolicyError};
