//! Status Reporting
//!
//! Builds the outbound progress replies and hot-standby feedback the
//! receiver owes the primary. The reporter is pure bookkeeping: it decides
//! whether a message is owed and builds it; the streaming loop owns the
//! send and the wakeup deadlines.
//!
//! Replies are suppressed while nothing changed and no deadline or request
//! calls for one. Feedback remembers whether the primary currently holds a
//! transaction horizon on our behalf, so disabling feedback sends exactly
//! one final message clearing it.

use crate::lsn::{Lsn, TimestampMicros};
use crate::protocol::StandbyMessage;
use crate::receiver::recovery::{RecoveryHandle, INVALID_XID};

pub struct StatusReporter {
    last_write: Lsn,
    last_flush: Lsn,
    /// Whether the primary still holds a horizon we advertised. Starts
    /// true so the first pass after connecting always reports, clearing
    /// any horizon left over from a previous incarnation.
    primary_has_standby_xmin: bool,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        StatusReporter {
            last_write: Lsn(0),
            last_flush: Lsn(0),
            primary_has_standby_xmin: true,
        }
    }

    /// Build a progress reply if one is owed: positions moved, the reply
    /// deadline came due, or the caller forces it. `request_reply` asks
    /// the primary to answer with a keepalive.
    pub fn maybe_reply(
        &mut self,
        write: Lsn,
        flush: Lsn,
        apply: Lsn,
        force: bool,
        due: bool,
        request_reply: bool,
        now: TimestampMicros,
    ) -> Option<StandbyMessage> {
        if !force && !due && write == self.last_write && flush == self.last_flush {
            return None;
        }
        self.last_write = write;
        self.last_flush = flush;
        Some(StandbyMessage::StatusUpdate {
            write,
            flush,
            apply,
            send_time: now,
            reply_requested: request_reply,
        })
    }

    /// Build a hot-standby feedback message if one is owed. `enabled` is
    /// the effective setting (feedback flag and a non-zero interval);
    /// when it goes false, one final message with invalid xids clears the
    /// horizon the primary holds, after which nothing more is sent.
    pub fn maybe_feedback<R: RecoveryHandle>(
        &mut self,
        enabled: bool,
        recovery: &R,
        now: TimestampMicros,
    ) -> Option<StandbyMessage> {
        if !enabled && !self.primary_has_standby_xmin {
            return None;
        }
        // Nothing worth reporting before the standby accepts queries.
        if !recovery.hot_standby_active() {
            return None;
        }

        let (xmin, catalog_xmin) = if enabled {
            recovery.replication_horizons()
        } else {
            (INVALID_XID, INVALID_XID)
        };

        let next_full = recovery.next_full_xid();
        let xmin_epoch = epoch_for(xmin, next_full);
        let catalog_xmin_epoch = epoch_for(catalog_xmin, next_full);

        self.primary_has_standby_xmin = xmin != INVALID_XID || catalog_xmin != INVALID_XID;

        Some(StandbyMessage::HotStandbyFeedback {
            send_time: now,
            xmin,
            xmin_epoch,
            catalog_xmin,
            catalog_xmin_epoch,
        })
    }
}

/// Epoch of `xid` given the next full transaction id. An xid at or below
/// the next xid belongs to the current epoch; one above it has not been
/// reached this epoch, so it must be from the previous one.
fn epoch_for(xid: u32, next_full_xid: u64) -> u32 {
    let next_epoch = (next_full_xid >> 32) as u32;
    let next_xid = next_full_xid as u32;
    if xid > next_xid {
        next_epoch.wrapping_sub(1)
    } else {
        next_epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::recovery::StubRecovery;

    #[test]
    fn test_reply_suppressed_when_idle() {
        let mut rep = StatusReporter::new();
        // First call reports (positions moved off the initial zeros)
        assert!(rep
            .maybe_reply(Lsn(10), Lsn(10), Lsn(5), false, false, false, 1)
            .is_some());
        // Nothing changed, nothing due
        assert!(rep
            .maybe_reply(Lsn(10), Lsn(10), Lsn(5), false, false, false, 2)
            .is_none());
    }

    #[test]
    fn test_reply_on_progress() {
        let mut rep = StatusReporter::new();
        rep.maybe_reply(Lsn(10), Lsn(10), Lsn(5), false, false, false, 1);

        let msg = rep
            .maybe_reply(Lsn(20), Lsn(10), Lsn(5), false, false, false, 2)
            .unwrap();
        assert_eq!(
            msg,
            StandbyMessage::StatusUpdate {
                write: Lsn(20),
                flush: Lsn(10),
                apply: Lsn(5),
                send_time: 2,
                reply_requested: false,
            }
        );
    }

    #[test]
    fn test_reply_on_deadline_or_force() {
        let mut rep = StatusReporter::new();
        rep.maybe_reply(Lsn(10), Lsn(10), Lsn(5), false, false, false, 1);

        assert!(rep
            .maybe_reply(Lsn(10), Lsn(10), Lsn(5), false, true, false, 2)
            .is_some());
        assert!(rep
            .maybe_reply(Lsn(10), Lsn(10), Lsn(5), true, false, true, 3)
            .is_some());
    }

    #[test]
    fn test_reply_request_flag_propagates() {
        let mut rep = StatusReporter::new();
        let msg = rep
            .maybe_reply(Lsn(1), Lsn(1), Lsn(0), true, false, true, 9)
            .unwrap();
        assert!(matches!(
            msg,
            StandbyMessage::StatusUpdate {
                reply_requested: true,
                ..
            }
        ));
    }

    #[test]
    fn test_feedback_reports_horizons() {
        let mut rep = StatusReporter::new();
        let recovery = StubRecovery::new(1);
        recovery.set_horizons(1000, 900);
        recovery.set_next_full_xid((2u64 << 32) | 1500);

        let msg = rep.maybe_feedback(true, &recovery, 7).unwrap();
        assert_eq!(
            msg,
            StandbyMessage::HotStandbyFeedback {
                send_time: 7,
                xmin: 1000,
                xmin_epoch: 2,
                catalog_xmin: 900,
                catalog_xmin_epoch: 2,
            }
        );
    }

    #[test]
    fn test_feedback_epoch_decrement_across_wraparound() {
        let mut rep = StatusReporter::new();
        let recovery = StubRecovery::new(1);
        // Next xid wrapped into epoch 3, but the horizon is from epoch 2
        recovery.set_horizons(0xFFFF_FF00, INVALID_XID);
        recovery.set_next_full_xid((3u64 << 32) | 100);

        let msg = rep.maybe_feedback(true, &recovery, 7).unwrap();
        assert!(matches!(
            msg,
            StandbyMessage::HotStandbyFeedback {
                xmin: 0xFFFF_FF00,
                xmin_epoch: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_feedback_disable_sends_one_clearing_message() {
        let mut rep = StatusReporter::new();
        let recovery = StubRecovery::new(1);
        recovery.set_horizons(1000, INVALID_XID);

        // Advertise a horizon, then disable
        rep.maybe_feedback(true, &recovery, 1).unwrap();
        let clearing = rep.maybe_feedback(false, &recovery, 2).unwrap();
        assert!(matches!(
            clearing,
            StandbyMessage::HotStandbyFeedback {
                xmin: INVALID_XID,
                catalog_xmin: INVALID_XID,
                ..
            }
        ));
        // Horizon cleared, no further traffic while disabled
        assert!(rep.maybe_feedback(false, &recovery, 3).is_none());
    }

    #[test]
    fn test_feedback_waits_for_hot_standby() {
        let mut rep = StatusReporter::new();
        let recovery = StubRecovery::new(1);
        recovery.set_hot_standby(false);
        assert!(rep.maybe_feedback(true, &recovery, 1).is_none());

        recovery.set_hot_standby(true);
        assert!(rep.maybe_feedback(true, &recovery, 2).is_some());
    }

    #[test]
    fn test_feedback_with_no_horizons_clears_and_goes_quiet() {
        let mut rep = StatusReporter::new();
        let recovery = StubRecovery::new(1);

        // Enabled but nothing to advertise: first message clears any
        // leftover horizon from a previous incarnation
        let first = rep.maybe_feedback(true, &recovery, 1).unwrap();
        assert!(matches!(
            first,
            StandbyMessage::HotStandbyFeedback {
                xmin: INVALID_XID,
                ..
            }
        ));
        // Once disabled there is nothing left to clear
        assert!(rep.maybe_feedback(false, &recovery, 2).is_none());
    }
}
