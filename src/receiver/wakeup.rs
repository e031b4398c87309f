//! Wakeup Scheduling
//!
//! The streaming loop naps between frames; this table tracks the next
//! deadline for each periodic duty so the nap can end exactly when the
//! earliest duty comes due. Deadlines are absolute `tokio::time::Instant`s,
//! so tests drive them with the paused clock.
//!
//! A disabled duty (zero interval, or feedback turned off) simply has no
//! deadline and never wakes the loop.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::ReceiverSettings;

/// The periodic duties of the streaming loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    /// Silence from the primary has exceeded the receiver timeout; the
    /// attempt must end.
    Terminate,
    /// Half the timeout has passed without traffic; ping the primary for
    /// a reply so a healthy connection resets the clock in time.
    Ping,
    /// Time to report write/flush progress.
    Reply,
    /// Time to refresh hot-standby feedback.
    HsFeedback,
}

const REASONS: [WakeupReason; 4] = [
    WakeupReason::Terminate,
    WakeupReason::Ping,
    WakeupReason::Reply,
    WakeupReason::HsFeedback,
];

impl WakeupReason {
    fn index(self) -> usize {
        match self {
            WakeupReason::Terminate => 0,
            WakeupReason::Ping => 1,
            WakeupReason::Reply => 2,
            WakeupReason::HsFeedback => 3,
        }
    }
}

/// Next-deadline table for the streaming loop's periodic duties.
#[derive(Debug, Default, Clone)]
pub struct WakeupTable {
    deadlines: [Option<Instant>; 4],
}

impl WakeupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute one duty's deadline relative to `now`.
    pub fn recompute(&mut self, reason: WakeupReason, now: Instant, settings: &ReceiverSettings) {
        let deadline = match reason {
            WakeupReason::Terminate => interval_deadline(now, settings.receiver_timeout),
            WakeupReason::Ping => interval_deadline(now, settings.receiver_timeout / 2),
            WakeupReason::Reply => interval_deadline(now, settings.status_interval),
            WakeupReason::HsFeedback => {
                if settings.hot_standby_feedback {
                    interval_deadline(now, settings.status_interval)
                } else {
                    None
                }
            }
        };
        self.deadlines[reason.index()] = deadline;
    }

    /// Recompute every deadline, e.g. after a settings reload.
    pub fn recompute_all(&mut self, now: Instant, settings: &ReceiverSettings) {
        for reason in REASONS {
            self.recompute(reason, now, settings);
        }
    }

    /// The earliest pending deadline, if any duty is enabled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.iter().flatten().min().copied()
    }

    /// How long the loop may nap from `now`. `None` means nap forever
    /// (every duty disabled); an overdue deadline yields a zero nap.
    pub fn nap(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Clear a duty's deadline entirely; it stays silent until the next
    /// recompute. Used to fire a duty at most once per quiet stretch.
    pub fn disarm(&mut self, reason: WakeupReason) {
        self.deadlines[reason.index()] = None;
    }

    /// Whether a duty's deadline has arrived.
    pub fn is_due(&self, reason: WakeupReason, now: Instant) -> bool {
        match self.deadlines[reason.index()] {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

fn interval_deadline(now: Instant, interval: Duration) -> Option<Instant> {
    if interval.is_zero() {
        None
    } else {
        Some(now + interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(timeout_ms: u64, interval_ms: u64, feedback: bool) -> ReceiverSettings {
        ReceiverSettings {
            receiver_timeout: Duration::from_millis(timeout_ms),
            status_interval: Duration::from_millis(interval_ms),
            hot_standby_feedback: feedback,
        }
    }

    #[test]
    fn test_ping_at_half_timeout() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        table.recompute_all(now, &settings(60_000, 10_000, false));

        assert!(table.is_due(WakeupReason::Ping, now + Duration::from_secs(30)));
        assert!(!table.is_due(WakeupReason::Ping, now + Duration::from_secs(29)));
        assert!(table.is_due(WakeupReason::Terminate, now + Duration::from_secs(60)));
        assert!(!table.is_due(WakeupReason::Terminate, now + Duration::from_secs(59)));
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        table.recompute_all(now, &settings(60_000, 10_000, false));

        // Reply interval (10s) is earlier than ping (30s)
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(10)));
        assert_eq!(table.nap(now), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_disabled_duties_never_wake() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        table.recompute_all(now, &settings(0, 0, false));

        assert_eq!(table.next_deadline(), None);
        assert_eq!(table.nap(now), None);
        assert!(!table.is_due(WakeupReason::Terminate, now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_feedback_needs_flag_and_interval() {
        let now = Instant::now();
        let mut table = WakeupTable::new();

        table.recompute_all(now, &settings(60_000, 10_000, false));
        assert!(!table.is_due(WakeupReason::HsFeedback, now + Duration::from_secs(3600)));

        table.recompute_all(now, &settings(60_000, 10_000, true));
        assert!(table.is_due(WakeupReason::HsFeedback, now + Duration::from_secs(10)));

        table.recompute_all(now, &settings(60_000, 0, true));
        assert!(!table.is_due(WakeupReason::HsFeedback, now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_overdue_deadline_gives_zero_nap() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        table.recompute_all(now, &settings(1_000, 100, false));

        assert_eq!(table.nap(now + Duration::from_secs(5)), Some(Duration::ZERO));
    }

    #[test]
    fn test_disarm_silences_duty() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        let cfg = settings(60_000, 0, false);
        table.recompute_all(now, &cfg);

        table.disarm(WakeupReason::Ping);
        assert!(!table.is_due(WakeupReason::Ping, now + Duration::from_secs(3600)));
        // Terminate still armed
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(60)));

        table.recompute(WakeupReason::Ping, now, &cfg);
        assert!(table.is_due(WakeupReason::Ping, now + Duration::from_secs(30)));
    }

    #[test]
    fn test_recompute_single_duty() {
        let now = Instant::now();
        let mut table = WakeupTable::new();
        let cfg = settings(60_000, 10_000, false);
        table.recompute_all(now, &cfg);

        // Traffic arrived: terminate and ping push out, reply stays
        let later = now + Duration::from_secs(5);
        table.recompute(WakeupReason::Terminate, later, &cfg);
        table.recompute(WakeupReason::Ping, later, &cfg);

        assert!(!table.is_due(WakeupReason::Ping, now + Duration::from_secs(30)));
        assert!(table.is_due(WakeupReason::Ping, later + Duration::from_secs(30)));
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(10)));
    }
}
