//! Presence Module - Online-Status über eine persistente Verbindung
//!
//! Dieses Modul verwaltet den Presence-Kanal:
//! - Registrierung und Heartbeats
//! - Lokale Registry der Online-Status
//! - Reconnection mit exponentiellem Backoff
//!

mod channel;
mod messages;

pub use channel::{PresenceChannel, PresenceError, PresenceEvent};
pub use messages::*;
