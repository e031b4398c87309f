//! WAL Receiver Lifecycle
//!
//! The receiver connects to the primary, streams WAL into durable segment
//! files, and reports progress back. One call to [`WalReceiver::run`]
//! covers the receiver's whole life, across any number of streaming
//! attempts:
//!
//! ```text
//!   STOPPED ──▶ STARTING ──▶ STREAMING ──▶ WAITING ──▶ RESTARTING
//!                                 │            │             │
//!                                 │            └──── back to STREAMING
//!                                 ▼
//!                             STOPPING ──▶ STOPPED
//! ```
//!
//! An attempt ends on connection loss, protocol violation, silence
//! timeout, or the primary finishing its timeline; the receiver parks in
//! WAITING until a new start request arrives through
//! [`ReceiverControl::request_restart`]. Only segment I/O faults and a
//! startup collision are fatal to the whole run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{ArchiveMode, ReceiverConfig, ReceiverSettings, ReplicationSlot};
use crate::lsn::{history_file_name, now_micros, Lsn, TimeLineId};
use crate::protocol::{
    ConnError, PollResult, PrimaryConnector, ProtocolError, StreamOptions, WalSenderConnection,
    WalSenderMessage,
};
use crate::segment::{ArchiveDisposition, SegmentStore, WalIoError, WalSegmentWriter};
use crate::timeline::{parse_timeline_history, HistoryParseError};

pub mod recovery;
pub mod reporter;
pub mod status;
pub mod wakeup;

pub use recovery::{RecoveryHandle, StubRecovery, INVALID_XID};
pub use reporter::StatusReporter;
pub use status::{AlreadyRunning, ReceiverState, StatusSnapshot, WalReceiverStatus};
pub use wakeup::{WakeupReason, WakeupTable};

// ============================================================================
// Errors
// ============================================================================

/// Failure that ends one streaming attempt. The receiver logs it, parks
/// in WAITING, and survives to serve the next start request -- except for
/// `Io`, which `run` promotes to a fatal [`ReceiverError`].
#[derive(Debug)]
pub enum AttemptError {
    /// Could not establish the connection.
    Connect(ConnError),
    /// The connection failed mid-attempt.
    Stream(ConnError),
    /// The primary sent something indecipherable.
    Protocol(ProtocolError),
    /// A fetched timeline history file did not parse.
    History(HistoryParseError),
    /// The primary belongs to a different cluster.
    SystemIdMismatch { primary: u64, standby: u64 },
    /// The primary's timeline is older than the one we need.
    PrimaryTimelineBehind {
        primary: TimeLineId,
        requested: TimeLineId,
    },
    /// No traffic from the primary within the receiver timeout.
    SilenceTimeout { timeout: Duration },
    /// Segment I/O fault; fatal.
    Io(WalIoError),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Connect(e) => write!(f, "{}", e),
            AttemptError::Stream(e) => write!(f, "streaming failed: {}", e),
            AttemptError::Protocol(e) => write!(f, "invalid message from primary: {}", e),
            AttemptError::History(e) => write!(f, "invalid timeline history from primary: {}", e),
            AttemptError::SystemIdMismatch { primary, standby } => write!(
                f,
                "database system identifier differs between the primary and standby: \
                 primary identifier is {}, standby identifier is {}",
                primary, standby
            ),
            AttemptError::PrimaryTimelineBehind { primary, requested } => write!(
                f,
                "highest timeline {} of the primary is behind recovery timeline {}",
                primary, requested
            ),
            AttemptError::SilenceTimeout { timeout } => write!(
                f,
                "terminating replication due to timeout: no message from primary for {:?}",
                timeout
            ),
            AttemptError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AttemptError {}

/// Failure that ends the receiver's whole run.
#[derive(Debug)]
pub enum ReceiverError {
    /// Another receiver already holds the status record.
    AlreadyRunning(AlreadyRunning),
    /// Segment I/O fault; received bytes can no longer be made durable.
    Io(WalIoError),
}

impl std::fmt::Display for ReceiverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceiverError::AlreadyRunning(e) => write!(f, "{}", e),
            ReceiverError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ReceiverError {}

/// How one streaming attempt ended, other than by error.
#[derive(Debug)]
enum AttemptOutcome {
    /// The primary finished the timeline and ended the stream cleanly.
    StreamEnded { next_tli: TimeLineId },
    /// The primary had no WAL to send on the requested timeline.
    StreamRefused { primary_tli: TimeLineId },
    /// Shutdown was requested.
    Shutdown,
    /// Local recovery finished; streaming is no longer needed.
    RecoveryEnded,
}

// ============================================================================
// Control handle
// ============================================================================

/// External handle to a running receiver: shutdown, settings reload,
/// restart requests, and the shared status record.
pub struct ReceiverControl {
    status: Arc<WalReceiverStatus>,
    shutdown_tx: watch::Sender<bool>,
    settings_tx: watch::Sender<ReceiverSettings>,
}

impl ReceiverControl {
    pub fn status(&self) -> Arc<WalReceiverStatus> {
        Arc::clone(&self.status)
    }

    /// Request an orderly stop. The receiver flushes and closes its open
    /// segment before exiting.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.status.wake();
    }

    /// Replace the runtime-adjustable settings; the streaming loop picks
    /// them up without restarting the attempt.
    pub fn update_settings(&self, settings: ReceiverSettings) {
        let _ = self.settings_tx.send(settings);
    }

    /// Ask for an immediate progress reply to the primary.
    pub fn force_reply(&self) {
        self.status.force_reply();
    }

    /// Ask a parked receiver to begin a new attempt at `start`. Returns
    /// false if the receiver was not waiting.
    pub fn request_restart(&self, start: Lsn, tli: TimeLineId) -> bool {
        self.status.request_restart(start, tli)
    }

    /// Wait until the receiver has fully stopped.
    pub async fn wait_stopped(&self) {
        self.status.wait_stopped().await;
    }
}

// ============================================================================
// WalReceiver
// ============================================================================

/// The receiver process. Generic over its three collaborators: the
/// connection transport, the segment store, and the recovery process.
pub struct WalReceiver<C, S, R>
where
    C: PrimaryConnector,
    S: SegmentStore + Clone,
    R: RecoveryHandle,
{
    connector: C,
    store: S,
    writer: WalSegmentWriter<S>,
    recovery: Arc<R>,
    status: Arc<WalReceiverStatus>,
    config: ReceiverConfig,
    conninfo: String,
    slot: ReplicationSlot,
    settings_rx: watch::Receiver<ReceiverSettings>,
    shutdown_rx: watch::Receiver<bool>,
    reporter: StatusReporter,
    wakeups: WakeupTable,
    first_stream: bool,
}

impl<C, S, R> WalReceiver<C, S, R>
where
    C: PrimaryConnector,
    S: SegmentStore + Clone,
    R: RecoveryHandle,
{
    pub fn new(
        config: ReceiverConfig,
        conninfo: impl Into<String>,
        slot: ReplicationSlot,
        connector: C,
        store: S,
        recovery: Arc<R>,
    ) -> (Self, ReceiverControl) {
        let status = WalReceiverStatus::new();
        let mut writer =
            WalSegmentWriter::new(store.clone(), config.segment_size, config.archive_mode);
        writer.set_written_hint(status.written_upto());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (settings_tx, settings_rx) = watch::channel(config.settings);

        let control = ReceiverControl {
            status: Arc::clone(&status),
            shutdown_tx,
            settings_tx,
        };
        let receiver = WalReceiver {
            connector,
            store,
            writer,
            recovery,
            status,
            config,
            conninfo: conninfo.into(),
            slot,
            settings_rx,
            shutdown_rx,
            reporter: StatusReporter::new(),
            wakeups: WakeupTable::new(),
            first_stream: true,
        };
        (receiver, control)
    }

    /// Run the receiver until shutdown, recovery end, or a fatal error.
    /// `start`/`timeline` are where the first attempt begins streaming.
    pub async fn run(mut self, start: Lsn, timeline: TimeLineId) -> Result<(), ReceiverError> {
        let slot_name = match &self.slot {
            ReplicationSlot::Named(name) => Some(name.clone()),
            ReplicationSlot::Ephemeral | ReplicationSlot::None => None,
        };
        self.status
            .begin_startup(std::process::id(), start, timeline, slot_name)
            .map_err(ReceiverError::AlreadyRunning)?;
        info!(%start, timeline, "WAL receiver starting");

        let result = self.run_cycles().await;

        self.status.set_state(ReceiverState::Stopping);
        if let Err(e) = self.writer.close_current() {
            error!(error = %e, "could not close WAL segment during shutdown");
            self.status.mark_stopped();
            return Err(ReceiverError::Io(e));
        }
        // Whatever was flushed on the way out may be applyable.
        self.recovery.wakeup();
        self.status.mark_stopped();
        info!("WAL receiver stopped");
        result
    }

    async fn run_cycles(&mut self) -> Result<(), ReceiverError> {
        loop {
            let (start, tli) = self.status.receive_start();
            match self.run_attempt(start, tli).await {
                Ok(AttemptOutcome::Shutdown) => return Ok(()),
                Ok(AttemptOutcome::RecoveryEnded) => {
                    info!("recovery has finished; WAL receiver exiting");
                    return Ok(());
                }
                Ok(AttemptOutcome::StreamEnded { next_tli }) => {
                    info!(
                        end_timeline = next_tli,
                        "replication terminated by primary server"
                    );
                }
                Ok(AttemptOutcome::StreamRefused { primary_tli }) => {
                    info!(
                        timeline = tli,
                        primary_timeline = primary_tli,
                        "primary has no WAL on requested timeline"
                    );
                }
                Err(AttemptError::Io(e)) => return Err(ReceiverError::Io(e)),
                Err(e) => warn!(error = %e, "streaming attempt failed"),
            }

            // Park until someone asks for a new attempt.
            self.status.set_state(ReceiverState::Waiting);
            debug!("WAL receiver waiting for new start request");
            loop {
                if *self.shutdown_rx.borrow() {
                    return Ok(());
                }
                if self.status.state() == ReceiverState::Restarting {
                    break;
                }
                let status = Arc::clone(&self.status);
                let mut shutdown = self.shutdown_rx.clone();
                tokio::select! {
                    _ = status.wait_wake() => {}
                    res = shutdown.changed() => {
                        if res.is_err() {
                            // Control handle gone: nobody can restart us.
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &mut self,
        start: Lsn,
        tli: TimeLineId,
    ) -> Result<AttemptOutcome, AttemptError> {
        if !self.recovery.recovery_in_progress() {
            return Ok(AttemptOutcome::RecoveryEnded);
        }

        let mut conn = self
            .connector
            .connect(&self.conninfo, &self.config.cluster_name)
            .await
            .map_err(AttemptError::Connect)?;
        let (sender_host, sender_port) = conn.sender_info();
        self.status
            .connected(conn.conninfo_display(), sender_host, sender_port);

        // Every exit past this point, error or not, closes the connection.
        let outcome = self.negotiate_and_stream(&mut conn, start, tli).await;
        conn.disconnect().await;
        outcome
    }

    async fn negotiate_and_stream(
        &mut self,
        conn: &mut C::Conn,
        start: Lsn,
        tli: TimeLineId,
    ) -> Result<AttemptOutcome, AttemptError> {
        let identity = conn.identify_system().await.map_err(AttemptError::Stream)?;
        let standby_id = self.recovery.system_identifier();
        if identity.system_id != standby_id {
            return Err(AttemptError::SystemIdMismatch {
                primary: identity.system_id,
                standby: standby_id,
            });
        }
        if identity.timeline < tli {
            return Err(AttemptError::PrimaryTimelineBehind {
                primary: identity.timeline,
                requested: tli,
            });
        }

        self.fetch_history_range(conn, tli, identity.timeline)
            .await?;

        let slot = match &self.slot {
            ReplicationSlot::Named(name) => Some(name.clone()),
            ReplicationSlot::Ephemeral => {
                let name = format!("walrecv_{}", conn.backend_pid());
                conn.create_ephemeral_slot(&name)
                    .await
                    .map_err(AttemptError::Stream)?;
                self.status.set_slot_name(Some(name.clone()));
                Some(name)
            }
            ReplicationSlot::None => None,
        };

        self.writer.begin(start, tli).map_err(AttemptError::Io)?;

        let accepted = conn
            .start_streaming(&StreamOptions {
                start,
                timeline: tli,
                slot,
            })
            .await
            .map_err(AttemptError::Stream)?;
        if !accepted {
            return Ok(AttemptOutcome::StreamRefused {
                primary_tli: identity.timeline,
            });
        }

        if self.first_stream {
            self.first_stream = false;
            info!(%start, timeline = tli, "started streaming WAL from primary");
        } else {
            info!(%start, timeline = tli, "restarted WAL streaming from primary");
        }
        self.status.set_state(ReceiverState::Streaming);

        self.stream_loop(conn, tli).await
    }

    /// The streaming attempt proper: drain buffered frames, flush and
    /// report at batch boundaries, nap until traffic or the next duty.
    async fn stream_loop(
        &mut self,
        conn: &mut C::Conn,
        tli: TimeLineId,
    ) -> Result<AttemptOutcome, AttemptError> {
        let mut settings_rx = self.settings_rx.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut settings = *settings_rx.borrow_and_update();
        let mut settings_closed = false;

        self.wakeups.recompute_all(Instant::now(), &settings);

        // Tell the primary where we are before the first frame arrives.
        self.send_reply(conn, &settings, true, false).await?;
        self.send_feedback(conn, &settings).await?;

        enum Waited {
            Readable,
            Woken,
            SettingsChanged,
            Shutdown,
            Deadline,
        }

        loop {
            let mut received_any = false;
            loop {
                match conn.try_receive().map_err(AttemptError::Stream)? {
                    PollResult::Frame(frame) => {
                        received_any = true;
                        let now = Instant::now();
                        self.wakeups
                            .recompute(WakeupReason::Terminate, now, &settings);
                        self.wakeups.recompute(WakeupReason::Ping, now, &settings);

                        match WalSenderMessage::decode(frame).map_err(AttemptError::Protocol)? {
                            WalSenderMessage::WalData {
                                start,
                                wal_end,
                                send_time,
                                body,
                            } => {
                                self.writer
                                    .write(start, &body)
                                    .map_err(AttemptError::Io)?;
                                self.status.note_sender_message(wal_end, send_time, now_micros());
                            }
                            WalSenderMessage::Keepalive {
                                wal_end,
                                send_time,
                                reply_requested,
                            } => {
                                self.status.note_sender_message(wal_end, send_time, now_micros());
                                if reply_requested {
                                    // Answer immediately with durable truth.
                                    self.flush_progress(tli)?;
                                    self.send_reply(conn, &settings, true, false).await?;
                                }
                            }
                        }
                    }
                    PollResult::WouldBlock => break,
                    PollResult::EndOfStream => {
                        return self.finish_stream(conn, &settings, tli).await;
                    }
                }
            }

            if received_any {
                self.flush_progress(tli)?;
                self.send_reply(conn, &settings, false, false).await?;
            }

            if !self.recovery.recovery_in_progress() {
                return Ok(AttemptOutcome::RecoveryEnded);
            }
            if *shutdown_rx.borrow() {
                return Ok(AttemptOutcome::Shutdown);
            }

            let waited = {
                let status = Arc::clone(&self.status);
                let deadline = self.wakeups.next_deadline();
                tokio::select! {
                    _ = conn.readable() => Waited::Readable,
                    _ = status.wait_wake() => Waited::Woken,
                    res = settings_rx.changed(), if !settings_closed => {
                        if res.is_err() {
                            settings_closed = true;
                        }
                        Waited::SettingsChanged
                    }
                    _ = shutdown_rx.changed() => Waited::Shutdown,
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() => Waited::Deadline,
                }
            };

            match waited {
                Waited::Readable => {}
                // Signalled, or the control handle is gone; either way the
                // orderly exit path runs.
                Waited::Shutdown => return Ok(AttemptOutcome::Shutdown),
                Waited::Woken => {
                    if self.status.take_force_reply() {
                        self.flush_progress(tli)?;
                        self.send_reply(conn, &settings, true, false).await?;
                    }
                }
                Waited::SettingsChanged => {
                    if !settings_closed {
                        settings = *settings_rx.borrow_and_update();
                        info!(
                            timeout_ms = settings.receiver_timeout.as_millis() as u64,
                            interval_ms = settings.status_interval.as_millis() as u64,
                            hot_standby_feedback = settings.hot_standby_feedback,
                            "receiver settings reloaded"
                        );
                        self.wakeups.recompute_all(Instant::now(), &settings);
                        // Feedback state may have flipped; report at once.
                        self.send_feedback(conn, &settings).await?;
                    }
                }
                Waited::Deadline => {
                    let now = Instant::now();
                    if self.wakeups.is_due(WakeupReason::Terminate, now) {
                        return Err(AttemptError::SilenceTimeout {
                            timeout: settings.receiver_timeout,
                        });
                    }
                    let mut request_reply = false;
                    if self.wakeups.is_due(WakeupReason::Ping, now) {
                        // One ping per silent stretch; traffic re-arms it.
                        request_reply = true;
                        self.wakeups.disarm(WakeupReason::Ping);
                    }
                    let feedback_due = self.wakeups.is_due(WakeupReason::HsFeedback, now);
                    self.send_reply(conn, &settings, request_reply, request_reply)
                        .await?;
                    // Feedback refreshes at most once per status interval;
                    // a ping wake alone must not emit an extra frame.
                    if feedback_due {
                        self.send_feedback(conn, &settings).await?;
                    }
                }
            }
        }
    }

    /// Clean end of stream: make everything durable, report it, leave
    /// streaming mode, and pick up any new timeline history.
    async fn finish_stream(
        &mut self,
        conn: &mut C::Conn,
        settings: &ReceiverSettings,
        tli: TimeLineId,
    ) -> Result<AttemptOutcome, AttemptError> {
        self.flush_progress(tli)?;
        self.send_reply(conn, settings, true, false).await?;

        let next_tli = conn.end_streaming().await.map_err(AttemptError::Stream)?;
        if next_tli > tli {
            self.fetch_history_range(conn, tli, next_tli).await?;
        }
        self.writer.close_current().map_err(AttemptError::Io)?;
        Ok(AttemptOutcome::StreamEnded { next_tli })
    }

    /// Flush written bytes and propagate the new durable position to the
    /// status record and the recovery process.
    fn flush_progress(&mut self, tli: TimeLineId) -> Result<(), AttemptError> {
        if let Some(flush) = self.writer.flush().map_err(AttemptError::Io)? {
            self.status.update_flushed(flush, tli);
            self.recovery.wakeup();
        }
        Ok(())
    }

    async fn send_reply(
        &mut self,
        conn: &mut C::Conn,
        settings: &ReceiverSettings,
        force: bool,
        request_reply: bool,
    ) -> Result<(), AttemptError> {
        let due = self.wakeups.is_due(WakeupReason::Reply, Instant::now());
        let write = self.writer.write_pos();
        let flush = self.writer.flush_pos();
        let apply = self.recovery.last_applied_lsn();
        if let Some(msg) =
            self.reporter
                .maybe_reply(write, flush, apply, force, due, request_reply, now_micros())
        {
            debug!(%write, %flush, %apply, "sending status update to primary");
            conn.send(msg.encode()).await.map_err(AttemptError::Stream)?;
            self.wakeups
                .recompute(WakeupReason::Reply, Instant::now(), settings);
        }
        Ok(())
    }

    async fn send_feedback(
        &mut self,
        conn: &mut C::Conn,
        settings: &ReceiverSettings,
    ) -> Result<(), AttemptError> {
        let enabled = settings.hot_standby_feedback && !settings.status_interval.is_zero();
        if let Some(msg) = self
            .reporter
            .maybe_feedback(enabled, &*self.recovery, now_micros())
        {
            debug!("sending hot standby feedback to primary");
            conn.send(msg.encode()).await.map_err(AttemptError::Stream)?;
        }
        self.wakeups
            .recompute(WakeupReason::HsFeedback, Instant::now(), settings);
        Ok(())
    }

    /// Fetch the history files for timelines in `[first, last]` that we do
    /// not have yet, validating name and content before storing them.
    /// Timeline 1 never has one.
    async fn fetch_history_range(
        &mut self,
        conn: &mut C::Conn,
        first: TimeLineId,
        last: TimeLineId,
    ) -> Result<(), AttemptError> {
        for tli in first..=last {
            if tli == 1 {
                continue;
            }
            let expected = history_file_name(tli);
            if self.store.exists(&expected) {
                continue;
            }

            let (name, content) = conn
                .read_history_file(tli)
                .await
                .map_err(AttemptError::Stream)?;
            if name != expected {
                return Err(AttemptError::Protocol(
                    ProtocolError::UnexpectedHistoryFileName {
                        expected,
                        actual: name,
                    },
                ));
            }
            let text = std::str::from_utf8(&content).map_err(|_| {
                AttemptError::History(HistoryParseError::Syntax {
                    line: "<non-utf8 content>".to_string(),
                })
            })?;
            parse_timeline_history(text, tli).map_err(AttemptError::History)?;

            self.store
                .write_history_file(&expected, &content)
                .map_err(AttemptError::Io)?;
            let disposition = match self.config.archive_mode {
                ArchiveMode::Always => ArchiveDisposition::Ready,
                ArchiveMode::On | ArchiveMode::Off => ArchiveDisposition::Done,
            };
            self.store
                .write_marker(&expected, disposition)
                .map_err(AttemptError::Io)?;
            info!(file = %expected, "fetched timeline history file from primary");
        }
        Ok(())
    }
}
