//! Recovery Process Interface
//!
//! The receiver's view of the local recovery/apply process: how far it has
//! applied, which transaction horizons standby queries still need, and a
//! wakeup hook fired whenever newly flushed WAL becomes available to apply.
//!
//! Production wires this to the real apply machinery; tests and demos use
//! [`StubRecovery`], an all-atomics stand-in.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::lsn::Lsn;

/// Transaction id `0` is the invalid/none sentinel.
pub const INVALID_XID: u32 = 0;

pub trait RecoveryHandle: Send + Sync + 'static {
    /// Whether recovery is still running. The receiver only streams while
    /// it is.
    fn recovery_in_progress(&self) -> bool;

    /// Whether the standby is accepting read-only queries. Feedback is
    /// pointless before that.
    fn hot_standby_active(&self) -> bool;

    /// Position recovery has applied through.
    fn last_applied_lsn(&self) -> Lsn;

    /// `(xmin, catalog_xmin)` still needed by standby queries;
    /// [`INVALID_XID`] where there is no requirement.
    fn replication_horizons(&self) -> (u32, u32);

    /// The next transaction id as a full 64-bit value, `epoch << 32 | xid`.
    fn next_full_xid(&self) -> u64;

    /// This cluster's system identifier, matched against the primary's.
    fn system_identifier(&self) -> u64;

    /// New WAL is durably available; wake the applier.
    fn wakeup(&self);
}

/// Atomics-backed stand-in for the recovery process.
#[derive(Debug)]
pub struct StubRecovery {
    in_progress: AtomicBool,
    hot_standby: AtomicBool,
    applied: AtomicU64,
    xmin: AtomicU32,
    catalog_xmin: AtomicU32,
    next_full_xid: AtomicU64,
    system_id: u64,
    wakeups: AtomicU64,
}

impl StubRecovery {
    pub fn new(system_id: u64) -> Self {
        StubRecovery {
            in_progress: AtomicBool::new(true),
            hot_standby: AtomicBool::new(true),
            applied: AtomicU64::new(0),
            xmin: AtomicU32::new(INVALID_XID),
            catalog_xmin: AtomicU32::new(INVALID_XID),
            next_full_xid: AtomicU64::new(3), // first normal xid
            system_id,
            wakeups: AtomicU64::new(0),
        }
    }

    pub fn set_in_progress(&self, v: bool) {
        self.in_progress.store(v, Ordering::Release);
    }

    pub fn set_hot_standby(&self, v: bool) {
        self.hot_standby.store(v, Ordering::Release);
    }

    pub fn set_applied(&self, lsn: Lsn) {
        self.applied.store(lsn.0, Ordering::Release);
    }

    pub fn set_horizons(&self, xmin: u32, catalog_xmin: u32) {
        self.xmin.store(xmin, Ordering::Release);
        self.catalog_xmin.store(catalog_xmin, Ordering::Release);
    }

    pub fn set_next_full_xid(&self, full: u64) {
        self.next_full_xid.store(full, Ordering::Release);
    }

    /// How many times the applier has been woken.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeups.load(Ordering::Acquire)
    }
}

impl RecoveryHandle for StubRecovery {
    fn recovery_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    fn hot_standby_active(&self) -> bool {
        self.hot_standby.load(Ordering::Acquire)
    }

    fn last_applied_lsn(&self) -> Lsn {
        Lsn(self.applied.load(Ordering::Acquire))
    }

    fn replication_horizons(&self) -> (u32, u32) {
        (
            self.xmin.load(Ordering::Acquire),
            self.catalog_xmin.load(Ordering::Acquire),
        )
    }

    fn next_full_xid(&self) -> u64 {
        self.next_full_xid.load(Ordering::Acquire)
    }

    fn system_identifier(&self) -> u64 {
        self.system_id
    }

    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::AcqRel);
    }
}
