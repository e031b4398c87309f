//! Shared Receiver Status
//!
//! One process-wide record describing the receiver: lifecycle state,
//! connection identity, and stream progress. Everything behind a short
//! critical section except the written-up-to hint, which is a lock-free
//! atomic so readers polling it never contend with the hot write path.
//!
//! Observers read through [`WalReceiverStatus::snapshot`], which filters
//! connection details for unprivileged callers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::lsn::{Lsn, TimeLineId, TimestampMicros};

/// Lifecycle states of the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Not running, no start pending.
    Stopped,
    /// Start requested, streaming not yet established.
    Starting,
    /// Connected and consuming the stream.
    Streaming,
    /// Attempt ended; parked until the next start request.
    Waiting,
    /// New start request noticed while parked.
    Restarting,
    /// Shutdown requested; the receiver is on its way out.
    Stopping,
}

impl std::fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReceiverState::Stopped => "stopped",
            ReceiverState::Starting => "starting",
            ReceiverState::Streaming => "streaming",
            ReceiverState::Waiting => "waiting",
            ReceiverState::Restarting => "restarting",
            ReceiverState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// A start request was made while the receiver is already active.
#[derive(Debug, PartialEq, Eq)]
pub struct AlreadyRunning {
    pub state: ReceiverState,
}

impl std::fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WAL receiver already active in state {}", self.state)
    }
}

impl std::error::Error for AlreadyRunning {}

#[derive(Debug)]
struct StatusInner {
    state: ReceiverState,
    pid: Option<u32>,
    /// Sanitized connection string, safe to display.
    conninfo: String,
    slot_name: Option<String>,
    sender_host: String,
    sender_port: u16,
    receive_start: Lsn,
    receive_start_tli: TimeLineId,
    /// Highest position known durable; `None` until the first flush of
    /// the first attempt.
    flushed_upto: Option<Lsn>,
    received_tli: TimeLineId,
    /// Where the latest flushed chunk began; (latest_chunk_start,
    /// flushed_upto] arrived in the current burst.
    latest_chunk_start: Lsn,
    latest_wal_end: Lsn,
    latest_wal_end_time: TimestampMicros,
    last_msg_send_time: TimestampMicros,
    last_msg_receipt_time: TimestampMicros,
    /// Connection fields are withheld from observers until sanitized.
    ready_to_display: bool,
}

impl Default for StatusInner {
    fn default() -> Self {
        StatusInner {
            state: ReceiverState::Stopped,
            pid: None,
            conninfo: String::new(),
            slot_name: None,
            sender_host: String::new(),
            sender_port: 0,
            receive_start: Lsn(0),
            receive_start_tli: 0,
            flushed_upto: None,
            received_tli: 0,
            latest_chunk_start: Lsn(0),
            latest_wal_end: Lsn(0),
            latest_wal_end_time: 0,
            last_msg_send_time: 0,
            last_msg_receipt_time: 0,
            ready_to_display: false,
        }
    }
}

/// Shared status record. Clone-cheap via `Arc`.
#[derive(Default)]
pub struct WalReceiverStatus {
    inner: Mutex<StatusInner>,
    /// Lock-free copy of the write position, mirrored from the writer.
    written_upto: Arc<AtomicU64>,
    force_reply: AtomicBool,
    /// Wakes the streaming loop out of its nap.
    wake: Notify,
    /// Signalled when the receiver reaches STOPPED.
    stopped: Notify,
}

/// Observer view of the status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub pid: Option<u32>,
    pub state: ReceiverState,
    pub receive_start: Lsn,
    pub receive_start_tli: TimeLineId,
    pub written_upto: Lsn,
    pub flushed_upto: Option<Lsn>,
    pub received_tli: TimeLineId,
    pub latest_chunk_start: Lsn,
    pub last_msg_send_time: TimestampMicros,
    pub last_msg_receipt_time: TimestampMicros,
    pub latest_wal_end: Lsn,
    pub latest_wal_end_time: TimestampMicros,
    /// Privileged-only fields; `None` for unprivileged observers.
    pub slot_name: Option<String>,
    pub sender_host: Option<String>,
    pub sender_port: Option<u16>,
    pub conninfo: Option<String>,
}

impl WalReceiverStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> ReceiverState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: ReceiverState) {
        self.inner.lock().state = state;
    }

    /// Validate and perform the startup transition. Only a stopped (or
    /// stopping) receiver may start; anything else is a caller bug.
    pub fn begin_startup(
        &self,
        pid: u32,
        start: Lsn,
        tli: TimeLineId,
        slot_name: Option<String>,
    ) -> Result<(), AlreadyRunning> {
        let mut inner = self.inner.lock();
        match inner.state {
            ReceiverState::Stopped | ReceiverState::Stopping => {}
            other => return Err(AlreadyRunning { state: other }),
        }
        inner.state = ReceiverState::Starting;
        inner.pid = Some(pid);
        inner.ready_to_display = false;
        inner.receive_start = start;
        inner.receive_start_tli = tli;
        inner.slot_name = slot_name;
        inner.conninfo.clear();
        inner.sender_host.clear();
        inner.sender_port = 0;
        self.written_upto.store(0, Ordering::Release);
        Ok(())
    }

    /// Record the sanitized connection identity and open the record for
    /// display.
    pub fn connected(&self, conninfo: String, sender_host: String, sender_port: u16) {
        let mut inner = self.inner.lock();
        inner.conninfo = conninfo;
        inner.sender_host = sender_host;
        inner.sender_port = sender_port;
        inner.ready_to_display = true;
    }

    /// Record the (possibly updated) start of the next attempt.
    pub fn restart_at(&self, start: Lsn, tli: TimeLineId) {
        let mut inner = self.inner.lock();
        inner.receive_start = start;
        inner.receive_start_tli = tli;
    }

    /// Ask a parked receiver to start a new attempt at `start`. Returns
    /// false if the receiver is not waiting, in which case nothing changes.
    pub fn request_restart(&self, start: Lsn, tli: TimeLineId) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ReceiverState::Waiting {
            return false;
        }
        inner.receive_start = start;
        inner.receive_start_tli = tli;
        inner.state = ReceiverState::Restarting;
        drop(inner);
        self.wake.notify_one();
        true
    }

    /// Record the slot name in use once it is known (ephemeral slots are
    /// named per connection).
    pub fn set_slot_name(&self, name: Option<String>) {
        self.inner.lock().slot_name = name;
    }

    pub fn receive_start(&self) -> (Lsn, TimeLineId) {
        let inner = self.inner.lock();
        (inner.receive_start, inner.receive_start_tli)
    }

    /// Record newly durable bytes. The previous flush position becomes
    /// the start of the latest chunk.
    pub fn update_flushed(&self, flush: Lsn, tli: TimeLineId) {
        let mut inner = self.inner.lock();
        if inner.flushed_upto.map_or(true, |f| f < flush) {
            inner.latest_chunk_start = inner.flushed_upto.unwrap_or(inner.receive_start);
            inner.flushed_upto = Some(flush);
            inner.received_tli = tli;
        }
    }

    pub fn flushed_upto(&self) -> Option<Lsn> {
        self.inner.lock().flushed_upto
    }

    /// Record the primary's reported stream head and message send time.
    pub fn note_sender_message(&self, wal_end: Lsn, send_time: TimestampMicros, now: TimestampMicros) {
        let mut inner = self.inner.lock();
        if wal_end > inner.latest_wal_end {
            inner.latest_wal_end = wal_end;
            inner.latest_wal_end_time = send_time;
        }
        inner.last_msg_send_time = send_time;
        inner.last_msg_receipt_time = now;
    }

    pub fn last_msg_receipt_time(&self) -> TimestampMicros {
        self.inner.lock().last_msg_receipt_time
    }

    pub fn latest_wal_end(&self) -> Lsn {
        self.inner.lock().latest_wal_end
    }

    /// Shared handle to the lock-free write-position mirror. The writer
    /// publishes into it directly.
    pub fn written_upto(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.written_upto)
    }

    /// Ask the receiver to send a status reply as soon as possible.
    pub fn force_reply(&self) {
        self.force_reply.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Consume a pending forced-reply request.
    pub fn take_force_reply(&self) -> bool {
        self.force_reply.swap(false, Ordering::AcqRel)
    }

    /// Wake the streaming loop out of its nap.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub async fn wait_wake(&self) {
        self.wake.notified().await;
    }

    /// Observer snapshot. Unprivileged callers see only the process
    /// identity; every other field is withheld, as is everything while
    /// the record is not yet ready to display.
    pub fn snapshot(&self, privileged: bool) -> Option<StatusSnapshot> {
        let inner = self.inner.lock();
        inner.pid?;

        if !privileged || !inner.ready_to_display {
            return Some(StatusSnapshot {
                pid: inner.pid,
                state: inner.state,
                receive_start: Lsn(0),
                receive_start_tli: 0,
                written_upto: Lsn(0),
                flushed_upto: None,
                received_tli: 0,
                latest_chunk_start: Lsn(0),
                last_msg_send_time: 0,
                last_msg_receipt_time: 0,
                latest_wal_end: Lsn(0),
                latest_wal_end_time: 0,
                slot_name: None,
                sender_host: None,
                sender_port: None,
                conninfo: None,
            });
        }

        Some(StatusSnapshot {
            pid: inner.pid,
            state: inner.state,
            receive_start: inner.receive_start,
            receive_start_tli: inner.receive_start_tli,
            written_upto: Lsn(self.written_upto.load(Ordering::Acquire)),
            flushed_upto: inner.flushed_upto,
            received_tli: inner.received_tli,
            latest_chunk_start: inner.latest_chunk_start,
            last_msg_send_time: inner.last_msg_send_time,
            last_msg_receipt_time: inner.last_msg_receipt_time,
            latest_wal_end: inner.latest_wal_end,
            latest_wal_end_time: inner.latest_wal_end_time,
            slot_name: inner.slot_name.clone(),
            sender_host: Some(inner.sender_host.clone()),
            sender_port: Some(inner.sender_port),
            conninfo: Some(inner.conninfo.clone()),
        })
    }

    /// Final transition out: the record survives with its last progress
    /// so a successor can resume from it.
    pub fn mark_stopped(&self) {
        let mut inner = self.inner.lock();
        inner.state = ReceiverState::Stopped;
        inner.pid = None;
        inner.ready_to_display = false;
        drop(inner);
        self.stopped.notify_waiters();
    }

    /// Wait until the receiver is stopped. Returns immediately if it
    /// already is.
    pub async fn wait_stopped(&self) {
        loop {
            let notified = self.stopped.notified();
            if self.state() == ReceiverState::Stopped {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Open the record for display and take a privileged snapshot.
    fn snapshot_ready(status: &WalReceiverStatus) -> StatusSnapshot {
        status.connected("host=primary".into(), "primary".into(), 5432);
        status.snapshot(true).unwrap()
    }

    #[test]
    fn test_startup_from_stopped() {
        let status = WalReceiverStatus::new();
        status
            .begin_startup(101, Lsn(0x1000), 1, Some("slot_a".into()))
            .unwrap();
        assert_eq!(status.state(), ReceiverState::Starting);
        assert_eq!(status.receive_start(), (Lsn(0x1000), 1));
    }

    #[test]
    fn test_startup_rejected_while_active() {
        let status = WalReceiverStatus::new();
        status.begin_startup(101, Lsn(0), 1, None).unwrap();
        status.set_state(ReceiverState::Streaming);

        let err = status.begin_startup(102, Lsn(0), 1, None).unwrap_err();
        assert_eq!(err.state, ReceiverState::Streaming);
    }

    #[test]
    fn test_startup_allowed_while_stopping() {
        let status = WalReceiverStatus::new();
        status.set_state(ReceiverState::Stopping);
        assert!(status.begin_startup(103, Lsn(0), 2, None).is_ok());
        assert_eq!(status.state(), ReceiverState::Starting);
    }

    #[test]
    fn test_flush_tracks_latest_chunk() {
        let status = WalReceiverStatus::new();
        status.begin_startup(1, Lsn(100), 1, None).unwrap();

        status.update_flushed(Lsn(200), 1);
        status.update_flushed(Lsn(350), 1);

        let snap = snapshot_ready(&status);
        assert_eq!(snap.flushed_upto, Some(Lsn(350)));
        assert_eq!(snap.latest_chunk_start, Lsn(200));
        assert_eq!(snap.received_tli, 1);
    }

    #[test]
    fn test_first_flush_chunk_starts_at_receive_start() {
        let status = WalReceiverStatus::new();
        status.begin_startup(1, Lsn(100), 1, None).unwrap();
        status.update_flushed(Lsn(180), 1);

        let snap = snapshot_ready(&status);
        assert_eq!(snap.latest_chunk_start, Lsn(100));
    }

    #[test]
    fn test_stale_flush_ignored() {
        let status = WalReceiverStatus::new();
        status.begin_startup(1, Lsn(0), 1, None).unwrap();
        status.update_flushed(Lsn(500), 1);
        status.update_flushed(Lsn(400), 1);
        assert_eq!(status.flushed_upto(), Some(Lsn(500)));
    }

    #[test]
    fn test_force_reply_consumed_once() {
        let status = WalReceiverStatus::new();
        assert!(!status.take_force_reply());
        status.force_reply();
        assert!(status.take_force_reply());
        assert!(!status.take_force_reply());
    }

    #[test]
    fn test_snapshot_hidden_until_ready() {
        let status = WalReceiverStatus::new();
        assert!(status.snapshot(true).is_none()); // no pid at all

        status.begin_startup(7, Lsn(0x2000), 3, None).unwrap();
        let snap = status.snapshot(true).unwrap();
        assert_eq!(snap.pid, Some(7));
        assert_eq!(snap.receive_start, Lsn(0)); // withheld until ready

        status.connected("host=primary".into(), "primary".into(), 5432);
        let snap = status.snapshot(true).unwrap();
        assert_eq!(snap.receive_start, Lsn(0x2000));
        assert_eq!(snap.conninfo.as_deref(), Some("host=primary"));
    }

    #[test]
    fn test_snapshot_privilege_filtering() {
        let status = WalReceiverStatus::new();
        status
            .begin_startup(7, Lsn(0), 1, Some("slot_a".into()))
            .unwrap();
        status.connected("host=primary".into(), "primary".into(), 5432);

        let privileged = status.snapshot(true).unwrap();
        assert_eq!(privileged.sender_host.as_deref(), Some("primary"));
        assert_eq!(privileged.slot_name.as_deref(), Some("slot_a"));

        let unprivileged = status.snapshot(false).unwrap();
        assert_eq!(unprivileged.pid, Some(7));
        assert!(unprivileged.sender_host.is_none());
        assert!(unprivileged.conninfo.is_none());
        assert!(unprivileged.slot_name.is_none());
    }

    #[test]
    fn test_unprivileged_snapshot_withholds_progress() {
        let status = WalReceiverStatus::new();
        status.begin_startup(7, Lsn(0x2000), 3, None).unwrap();
        status.connected("host=primary".into(), "primary".into(), 5432);
        status.update_flushed(Lsn(0x3000), 3);
        status.note_sender_message(Lsn(0x3000), 11, 12);

        // Everything but the process identity is nulled out
        let snap = status.snapshot(false).unwrap();
        assert_eq!(snap.pid, Some(7));
        assert_eq!(snap.receive_start, Lsn(0));
        assert_eq!(snap.receive_start_tli, 0);
        assert_eq!(snap.written_upto, Lsn(0));
        assert_eq!(snap.flushed_upto, None);
        assert_eq!(snap.latest_wal_end, Lsn(0));
        assert_eq!(snap.last_msg_receipt_time, 0);
    }

    #[test]
    fn test_request_restart_only_while_waiting() {
        let status = WalReceiverStatus::new();
        status.begin_startup(1, Lsn(0), 1, None).unwrap();
        assert!(!status.request_restart(Lsn(100), 2)); // starting, not waiting

        status.set_state(ReceiverState::Waiting);
        assert!(status.request_restart(Lsn(100), 2));
        assert_eq!(status.state(), ReceiverState::Restarting);
        assert_eq!(status.receive_start(), (Lsn(100), 2));
    }

    #[tokio::test]
    async fn test_wait_stopped_observes_transition() {
        let status = WalReceiverStatus::new();
        status.begin_startup(1, Lsn(0), 1, None).unwrap();

        let waiter = {
            let status = Arc::clone(&status);
            tokio::spawn(async move { status.wait_stopped().await })
        };
        tokio::task::yield_now().await;
        status.mark_stopped();
        waiter.await.unwrap();

        // Already stopped: returns immediately
        status.wait_stopped().await;
    }

    #[test]
    fn test_mark_stopped_clears_identity() {
        let status = WalReceiverStatus::new();
        status.begin_startup(7, Lsn(0), 1, None).unwrap();
        status.connected("c".into(), "h".into(), 1);
        status.update_flushed(Lsn(64), 1);

        status.mark_stopped();
        assert_eq!(status.state(), ReceiverState::Stopped);
        assert!(status.snapshot(true).is_none());
        // Progress survives for a successor
        assert_eq!(status.flushed_upto(), Some(Lsn(64)));
    }
}
