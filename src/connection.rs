//! Gemeinsame Bausteine für die persistenten Verbindungen
//!
//! Presence und Signaling laufen über dieselbe Art von Verbindung,
//! halten aber jeweils ihren eigenen Handle mit eigener Reconnect-Policy.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

/// Zustand einer physischen Verbindung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Nachrichten an den Write-Task einer Verbindung
pub(crate) enum Outbound {
    Frame(String),
    Close,
}

/// Wrapper um eine physische Verbindung
///
/// Wird bei jedem Reconnect komplett neu erzeugt, nie in-place
/// wiederverwendet. Die `id` dient als Identitäts-Check: Tasks einer
/// abgelösten Verbindung erkennen am Vergleich mit dem aktuell
/// installierten Handle, dass sie nichts mehr anfassen dürfen.
pub(crate) struct ConnectionHandle {
    pub id: Uuid,
    pub state: HandleState,
    pub retry_count: u32,
    pub last_opened_at: Option<DateTime<Utc>>,
    tx: Option<mpsc::Sender<Outbound>>,
}

impl ConnectionHandle {
    pub fn connecting(retry_count: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: HandleState::Connecting,
            retry_count,
            last_opened_at: None,
            tx: None,
        }
    }

    pub fn opened(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: HandleState::Open,
            retry_count: 0,
            last_opened_at: Some(Utc::now()),
            tx: Some(tx),
        }
    }

    /// Sender an den Write-Task, falls die Verbindung einen hat
    pub fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.tx.clone()
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Backoff-Verzögerung für den N-ten Reconnect-Versuch:
/// `min(1000 * 2^attempt, 30000)` Millisekunden
pub(crate) fn reconnect_delay(attempt: u32) -> Duration {
    let exp = 2u64.saturating_pow(attempt);
    Duration::from_millis(1000u64.saturating_mul(exp).min(30_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delay_backoff() {
        // delay(N) = min(1000 * 2^N, 30000)
        assert_eq!(reconnect_delay(0), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(1), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(2), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(4), Duration::from_millis(16000));
        // ab hier greift die Obergrenze
        assert_eq!(reconnect_delay(5), Duration::from_millis(30000));
        assert_eq!(reconnect_delay(10), Duration::from_millis(30000));
        assert_eq!(reconnect_delay(63), Duration::from_millis(30000));
    }

    #[test]
    fn test_new_handles_get_distinct_ids() {
        let a = ConnectionHandle::connecting(0);
        let b = ConnectionHandle::connecting(0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_opened_handle_resets_retry_count() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::opened(tx);
        assert_eq!(handle.retry_count, 0);
        assert_eq!(handle.state, HandleState::Open);
        assert!(handle.last_opened_at.is_some());
        assert!(handle.sender().is_some());
    }
}
