//! Anrufdauer-Policy
//!
//! Berechnet die erlaubte Gesprächsdauer aus dem Call-Day und zählt sie
//! während eines verbundenen Anrufs im Sekundentakt herunter. Die
//! Tabelle kommt aus der Konfiguration; spätere Tage eines Matches
//! erlauben längere Gespräche.

use crate::config::{CallPolicyConfig, DurationStep};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum PolicyError {
    #[error("Duration schedule is empty")]
    EmptySchedule,

    #[error("Duration schedule must be sorted by from_day")]
    UnsortedSchedule,

    #[error("Duration schedule must be non-decreasing in seconds")]
    DecreasingDuration,

    #[error("Call durations must be positive")]
    ZeroDuration,
}

// ============================================================================
// DURATION SCHEDULE
// ============================================================================

/// Validierte Dauer-Tabelle
///
/// Invarianten: mindestens ein Eintrag, aufsteigend nach `from_day`,
/// Sekunden > 0 und nie fallend. Damit ist
/// `allowed_duration_seconds(call_day)` für alle Tage monoton
/// nicht-fallend und immer positiv.
#[derive(Debug, Clone)]
pub struct DurationSchedule {
    steps: Vec<DurationStep>,
}

impl DurationSchedule {
    /// Baut eine Tabelle aus der Konfiguration und prüft die Invarianten
    pub fn from_config(config: &CallPolicyConfig) -> Result<Self, PolicyError> {
        let steps = config.schedule.clone();

        if steps.is_empty() {
            return Err(PolicyError::EmptySchedule);
        }
        for pair in steps.windows(2) {
            if pair[1].from_day <= pair[0].from_day {
                return Err(PolicyError::UnsortedSchedule);
            }
            if pair[1].seconds < pair[0].seconds {
                return Err(PolicyError::DecreasingDuration);
            }
        }
        if steps.iter().any(|step| step.seconds == 0) {
            return Err(PolicyError::ZeroDuration);
        }

        Ok(Self { steps })
    }

    /// Erlaubte Gesprächsdauer für einen Call-Day
    ///
    /// Reine Funktion: der letzte Eintrag mit `from_day <= call_day`
    /// gewinnt; Tage vor dem ersten Eintrag nutzen den ersten.
    pub fn allowed_duration_seconds(&self, call_day: u32) -> u32 {
        let mut seconds = self.steps[0].seconds;
        for step in &self.steps {
            if step.from_day <= call_day {
                seconds = step.seconds;
            } else {
                break;
            }
        }
        seconds
    }
}

impl Default for DurationSchedule {
    fn default() -> Self {
        // die Default-Tabelle erfüllt die Invarianten per Konstruktion
        Self::from_config(&CallPolicyConfig::default()).expect("default schedule is valid")
    }
}

// ============================================================================
// COUNTDOWN
// ============================================================================

/// Events des Countdown-Tickers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    /// Eine Sekunde ist vergangen
    Tick { remaining: u32 },

    /// Die erlaubte Dauer ist aufgebraucht
    Expired,
}

/// Sekundengenauer Countdown mit deterministischem Abbruch
///
/// Zählt monoton von der erlaubten Dauer auf null, ohne Pause-Zustand.
/// Bei null wird genau einmal `Expired` gemeldet, negativ wird der
/// Zähler nie. `cancel()` stoppt den Ticker sofort; ein bereits
/// abgebrochener Countdown sendet keine Events mehr.
pub(crate) struct Countdown {
    remaining: Arc<Mutex<u32>>,
    task: Option<JoinHandle<()>>,
}

impl Countdown {
    /// Startet den Countdown bei `seconds`
    pub fn start(seconds: u32, tx: mpsc::Sender<CountdownEvent>) -> Self {
        let remaining = Arc::new(Mutex::new(seconds));
        let shared = Arc::clone(&remaining);

        let task = tokio::spawn(async move {
            if seconds == 0 {
                let _ = tx.send(CountdownEvent::Expired).await;
                return;
            }

            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // der erste Tick eines Intervals feuert sofort
            interval.tick().await;

            loop {
                interval.tick().await;

                let now = {
                    let mut remaining = shared.lock();
                    *remaining = remaining.saturating_sub(1);
                    *remaining
                };

                if now == 0 {
                    let _ = tx.send(CountdownEvent::Expired).await;
                    break;
                }
                let _ = tx.send(CountdownEvent::Tick { remaining: now }).await;
            }
        });

        Self {
            remaining,
            task: Some(task),
        }
    }

    /// Verbleibende Sekunden
    pub fn remaining(&self) -> u32 {
        *self.remaining.lock()
    }

    /// Stoppt den Ticker; weitere Events können nicht mehr feuern
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_duration_monotonic_and_positive() {
        let schedule = DurationSchedule::default();

        let mut previous = 0;
        for call_day in 1..=60 {
            let allowed = schedule.allowed_duration_seconds(call_day);
            assert!(allowed > 0, "day {} must allow a positive duration", call_day);
            assert!(
                allowed >= previous,
                "day {} must not allow less than day {}",
                call_day,
                call_day - 1
            );
            previous = allowed;
        }
    }

    #[test]
    fn test_allowed_duration_default_table() {
        let schedule = DurationSchedule::default();

        assert_eq!(schedule.allowed_duration_seconds(1), 300);
        assert_eq!(schedule.allowed_duration_seconds(2), 600);
        assert_eq!(schedule.allowed_duration_seconds(3), 900);
        // Tag 4 liegt zwischen zwei Einträgen, der letzte gewinnt
        assert_eq!(schedule.allowed_duration_seconds(4), 900);
        assert_eq!(schedule.allowed_duration_seconds(7), 3600);
        assert_eq!(schedule.allowed_duration_seconds(365), 3600);
    }

    #[test]
    fn test_schedule_validation() {
        let empty = CallPolicyConfig { schedule: vec![] };
        assert!(matches!(
            DurationSchedule::from_config(&empty),
            Err(PolicyError::EmptySchedule)
        ));

        let unsorted = CallPolicyConfig {
            schedule: vec![
                DurationStep { from_day: 3, seconds: 600 },
                DurationStep { from_day: 1, seconds: 300 },
            ],
        };
        assert!(matches!(
            DurationSchedule::from_config(&unsorted),
            Err(PolicyError::UnsortedSchedule)
        ));

        let decreasing = CallPolicyConfig {
            schedule: vec![
                DurationStep { from_day: 1, seconds: 600 },
                DurationStep { from_day: 2, seconds: 300 },
            ],
        };
        assert!(matches!(
            DurationSchedule::from_config(&decreasing),
            Err(PolicyError::DecreasingDuration)
        ));

        let zero = CallPolicyConfig {
            schedule: vec![DurationStep { from_day: 1, seconds: 0 }],
        };
        assert!(matches!(
            DurationSchedule::from_config(&zero),
            Err(PolicyError::ZeroDuration)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_down_and_expires_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let countdown = Countdown::start(3, tx);

        assert_eq!(rx.recv().await, Some(CountdownEvent::Tick { remaining: 2 }));
        assert_eq!(rx.recv().await, Some(CountdownEvent::Tick { remaining: 1 }));
        assert_eq!(rx.recv().await, Some(CountdownEvent::Expired));
        assert_eq!(countdown.remaining(), 0);

        // nach Expired kommt nichts mehr, der Sender wird gedroppt
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_cancel_stops_ticker() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut countdown = Countdown::start(100, tx);

        assert_eq!(
            rx.recv().await,
            Some(CountdownEvent::Tick { remaining: 99 })
        );
        countdown.cancel();

        // der Task ist abgebrochen, der Sender damit gedroppt
        assert_eq!(rx.recv().await, None);
        assert_eq!(countdown.remaining(), 99);
    }
}
