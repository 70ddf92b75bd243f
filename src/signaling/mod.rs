//! Signaling Module - WebSocket-Transport für die Verbindungs-Negotiation
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - Raum-Beitritt und -Austritt
//! - Offer/Answer/Candidate rahmen und zustellen
//! - Eingehende Frames in typisierte Events demultiplexen
//!

mod messages;
mod transport;

pub use messages::*;
pub use transport::{
    RoomMembership, Signal, SignalingError, SignalingEvent, SignalingTransport,
};
