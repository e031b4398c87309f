//! Primary Connection Abstraction
//!
//! The transport library that actually speaks to the primary is an external
//! collaborator. This module defines the trait surface the receiver needs
//! ([`PrimaryConnector`] / [`WalSenderConnection`]) and a scripted in-memory
//! implementation for tests and demos, mirroring how the segment store
//! ships its in-memory backend next to the trait.
//!
//! `try_receive` is a non-blocking poll; `readable` is the suspension point
//! the main loop multiplexes with its wake handle and shutdown flag.

use crate::lsn::{Lsn, TimeLineId};
use crate::protocol::message::StandbyMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Result of the identify-system RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemIdentity {
    /// Unique identifier of the cluster the primary belongs to.
    pub system_id: u64,
    /// The primary's current (highest) timeline.
    pub timeline: TimeLineId,
}

/// Options for the start-replication RPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub start: Lsn,
    pub timeline: TimeLineId,
    /// Slot to stream from, or none.
    pub slot: Option<String>,
}

/// Connection-level failure. The transport is opaque, so this carries only
/// enough to log and classify; all variants end the streaming attempt.
#[derive(Debug)]
pub enum ConnError {
    /// Could not establish the connection.
    ConnectFailed(String),
    /// The connection dropped mid-operation.
    Closed,
    /// A command RPC failed on the primary side.
    Rpc(String),
}

impl std::fmt::Display for ConnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnError::ConnectFailed(msg) => {
                write!(f, "could not connect to the primary server: {}", msg)
            }
            ConnError::Closed => write!(f, "connection to primary closed"),
            ConnError::Rpc(msg) => write!(f, "replication command failed: {}", msg),
        }
    }
}

impl std::error::Error for ConnError {}

/// Non-blocking receive outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// One complete frame (tag byte plus payload).
    Frame(Bytes),
    /// Nothing buffered; wait on `readable` before polling again.
    WouldBlock,
    /// The primary ended the stream (COPY done). Not an error.
    EndOfStream,
}

/// Factory for connections to the primary.
pub trait PrimaryConnector: Send + 'static {
    type Conn: WalSenderConnection;

    /// Establish a replication connection.
    fn connect(
        &mut self,
        conninfo: &str,
        cluster_name: &str,
    ) -> impl std::future::Future<Output = Result<Self::Conn, ConnError>> + Send;
}

/// An established replication connection to the primary.
pub trait WalSenderConnection: Send {
    /// Query the primary's system identifier and highest timeline.
    fn identify_system(
        &mut self,
    ) -> impl std::future::Future<Output = Result<SystemIdentity, ConnError>> + Send;

    /// Create a temporary replication slot that lives as long as this
    /// connection.
    fn create_ephemeral_slot(
        &mut self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(), ConnError>> + Send;

    /// Ask the primary to start streaming. Returns false if the primary has
    /// no data to send on the requested timeline, which is a normal
    /// end-of-attempt.
    fn start_streaming(
        &mut self,
        options: &StreamOptions,
    ) -> impl std::future::Future<Output = Result<bool, ConnError>> + Send;

    /// Leave streaming mode. Returns the primary's timeline at stream end,
    /// which may be newer than when streaming began.
    fn end_streaming(
        &mut self,
    ) -> impl std::future::Future<Output = Result<TimeLineId, ConnError>> + Send;

    /// Fetch a timeline history file: (name the primary reports, content).
    fn read_history_file(
        &mut self,
        tli: TimeLineId,
    ) -> impl std::future::Future<Output = Result<(String, Bytes), ConnError>> + Send;

    /// Poll for one buffered frame without blocking.
    fn try_receive(&mut self) -> Result<PollResult, ConnError>;

    /// Wait until `try_receive` may make progress. Cancellation-safe; the
    /// main loop races this against its wake handle and deadlines.
    fn readable(&mut self) -> impl std::future::Future<Output = ()> + Send;

    /// Send one complete outbound frame.
    fn send(&mut self, frame: Bytes) -> impl std::future::Future<Output = Result<(), ConnError>> + Send;

    /// Backend process id serving this connection on the primary. Used to
    /// name ephemeral slots.
    fn backend_pid(&self) -> u32;

    /// Sanitized user-visible connection string.
    fn conninfo_display(&self) -> String;

    /// Host and port of the sender this connection reaches.
    fn sender_info(&self) -> (String, u16);

    /// Terminate the connection gracefully.
    fn disconnect(self) -> impl std::future::Future<Output = ()> + Send;
}

// ============================================================================
// ScriptedPrimary - in-memory primary for tests and demos
// ============================================================================

/// One scripted event on the stream.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// Deliver a complete frame.
    Frame(Bytes),
    /// The wire stays quiet for this long before the next event.
    Idle(Duration),
    /// The primary ends the stream.
    EndOfStream,
}

/// Script for one start-replication call.
#[derive(Debug, Clone)]
pub struct StreamScript {
    /// false: the primary reports no data on the requested timeline.
    pub accepted: bool,
    pub events: VecDeque<ScriptEvent>,
    /// Timeline reported by end-streaming.
    pub end_timeline: TimeLineId,
}

impl StreamScript {
    pub fn new(events: Vec<ScriptEvent>, end_timeline: TimeLineId) -> Self {
        StreamScript {
            accepted: true,
            events: events.into(),
            end_timeline,
        }
    }

    /// A stream the primary refuses (no data on the requested timeline).
    pub fn rejected(end_timeline: TimeLineId) -> Self {
        StreamScript {
            accepted: false,
            events: VecDeque::new(),
            end_timeline,
        }
    }
}

#[derive(Debug, Default)]
struct PrimaryScript {
    system_id: u64,
    timeline: TimeLineId,
    history: HashMap<TimeLineId, (String, Bytes)>,
    streams: VecDeque<StreamScript>,
    sent: Vec<StandbyMessage>,
    created_slots: Vec<String>,
    connect_attempts: u64,
    disconnects: u64,
    fail_next_connects: u32,
}

/// In-memory scripted primary. Clones share state, so tests keep one handle
/// to inspect what the receiver sent after handing a connector to it.
#[derive(Clone)]
pub struct ScriptedPrimary {
    inner: Arc<Mutex<PrimaryScript>>,
}

impl ScriptedPrimary {
    pub fn new(system_id: u64, timeline: TimeLineId) -> Self {
        ScriptedPrimary {
            inner: Arc::new(Mutex::new(PrimaryScript {
                system_id,
                timeline,
                ..PrimaryScript::default()
            })),
        }
    }

    /// Register a history file for a timeline, named deterministically.
    pub fn with_history(self, tli: TimeLineId, content: &str) -> Self {
        self.inner.lock().history.insert(
            tli,
            (
                crate::lsn::history_file_name(tli),
                Bytes::copy_from_slice(content.as_bytes()),
            ),
        );
        self
    }

    /// Register a history file under an arbitrary (possibly wrong) name.
    pub fn with_misnamed_history(self, tli: TimeLineId, name: &str, content: &str) -> Self {
        self.inner.lock().history.insert(
            tli,
            (name.to_string(), Bytes::copy_from_slice(content.as_bytes())),
        );
        self
    }

    /// Queue the script for the next start-replication call.
    pub fn push_stream(&self, script: StreamScript) {
        self.inner.lock().streams.push_back(script);
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.lock().fail_next_connects = n;
    }

    /// Everything the receiver has sent, in order.
    pub fn sent_messages(&self) -> Vec<StandbyMessage> {
        self.inner.lock().sent.clone()
    }

    /// Names of slots the receiver created.
    pub fn created_slots(&self) -> Vec<String> {
        self.inner.lock().created_slots.clone()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.lock().connect_attempts
    }

    /// How many connections have been gracefully closed.
    pub fn disconnects(&self) -> u64 {
        self.inner.lock().disconnects
    }
}

impl PrimaryConnector for ScriptedPrimary {
    type Conn = ScriptedConnection;

    async fn connect(
        &mut self,
        conninfo: &str,
        _cluster_name: &str,
    ) -> Result<ScriptedConnection, ConnError> {
        let mut script = self.inner.lock();
        script.connect_attempts += 1;
        if script.fail_next_connects > 0 {
            script.fail_next_connects -= 1;
            return Err(ConnError::ConnectFailed("scripted refusal".to_string()));
        }
        drop(script);
        Ok(ScriptedConnection {
            inner: Arc::clone(&self.inner),
            conninfo: conninfo.to_string(),
            current: None,
            ended: false,
        })
    }
}

/// A connection to a [`ScriptedPrimary`].
pub struct ScriptedConnection {
    inner: Arc<Mutex<PrimaryScript>>,
    conninfo: String,
    current: Option<StreamScript>,
    ended: bool,
}

impl WalSenderConnection for ScriptedConnection {
    async fn identify_system(&mut self) -> Result<SystemIdentity, ConnError> {
        let script = self.inner.lock();
        Ok(SystemIdentity {
            system_id: script.system_id,
            timeline: script.timeline,
        })
    }

    async fn create_ephemeral_slot(&mut self, name: &str) -> Result<(), ConnError> {
        self.inner.lock().created_slots.push(name.to_string());
        Ok(())
    }

    async fn start_streaming(&mut self, _options: &StreamOptions) -> Result<bool, ConnError> {
        let mut script = self.inner.lock();
        match script.streams.pop_front() {
            Some(stream) if stream.accepted => {
                drop(script);
                self.ended = false;
                self.current = Some(stream);
                Ok(true)
            }
            Some(stream) => {
                self.current = Some(StreamScript {
                    accepted: false,
                    events: VecDeque::new(),
                    end_timeline: stream.end_timeline,
                });
                Ok(false)
            }
            None => Err(ConnError::Rpc("no scripted stream queued".to_string())),
        }
    }

    async fn end_streaming(&mut self) -> Result<TimeLineId, ConnError> {
        let end_tli = self
            .current
            .take()
            .map(|s| s.end_timeline)
            .unwrap_or_else(|| self.inner.lock().timeline);
        self.ended = false;
        Ok(end_tli)
    }

    async fn read_history_file(&mut self, tli: TimeLineId) -> Result<(String, Bytes), ConnError> {
        let script = self.inner.lock();
        script
            .history
            .get(&tli)
            .cloned()
            .ok_or_else(|| ConnError::Rpc(format!("no history file for timeline {}", tli)))
    }

    fn try_receive(&mut self) -> Result<PollResult, ConnError> {
        if self.ended {
            return Ok(PollResult::EndOfStream);
        }
        let Some(stream) = self.current.as_mut() else {
            return Ok(PollResult::WouldBlock);
        };
        match stream.events.front() {
            Some(ScriptEvent::Frame(_)) => {
                let Some(ScriptEvent::Frame(frame)) = stream.events.pop_front() else {
                    unreachable!("front was a frame");
                };
                Ok(PollResult::Frame(frame))
            }
            Some(ScriptEvent::Idle(_)) => Ok(PollResult::WouldBlock),
            Some(ScriptEvent::EndOfStream) => {
                stream.events.pop_front();
                self.ended = true;
                Ok(PollResult::EndOfStream)
            }
            // Script exhausted without EndOfStream: the wire just goes
            // quiet, which is what silence-timeout tests need.
            None => Ok(PollResult::WouldBlock),
        }
    }

    async fn readable(&mut self) {
        let idle = match self.current.as_mut() {
            Some(stream) => match stream.events.front() {
                Some(ScriptEvent::Idle(d)) => {
                    let d = *d;
                    stream.events.pop_front();
                    Some(d)
                }
                Some(_) => return,
                None => None,
            },
            None => None,
        };
        match idle {
            Some(d) => tokio::time::sleep(d).await,
            // Nothing scripted: never becomes readable.
            None => std::future::pending().await,
        }
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), ConnError> {
        let msg = StandbyMessage::decode(&frame)
            .ok_or_else(|| ConnError::Rpc("unparseable standby message".to_string()))?;
        self.inner.lock().sent.push(msg);
        Ok(())
    }

    fn backend_pid(&self) -> u32 {
        4242
    }

    fn conninfo_display(&self) -> String {
        self.conninfo.clone()
    }

    fn sender_info(&self) -> (String, u16) {
        ("scripted-primary".to_string(), 5432)
    }

    async fn disconnect(self) {
        self.inner.lock().disconnects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::{encode_keepalive, encode_wal_data};

    #[tokio::test]
    async fn test_scripted_connect_and_identify() {
        let mut primary = ScriptedPrimary::new(0xABCD, 3);
        let mut conn = primary.connect("host=primary", "walrecv").await.unwrap();
        let ident = conn.identify_system().await.unwrap();
        assert_eq!(ident.system_id, 0xABCD);
        assert_eq!(ident.timeline, 3);
        assert_eq!(primary.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_failure() {
        let mut primary = ScriptedPrimary::new(1, 1);
        primary.fail_next_connects(1);
        assert!(matches!(
            primary.connect("host=primary", "walrecv").await,
            Err(ConnError::ConnectFailed(_))
        ));
        // Next attempt succeeds
        assert!(primary.connect("host=primary", "walrecv").await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_stream_delivery() {
        let mut primary = ScriptedPrimary::new(1, 1);
        primary.push_stream(StreamScript::new(
            vec![
                ScriptEvent::Frame(encode_wal_data(Lsn(0), Lsn(8), 1, b"01234567")),
                ScriptEvent::Frame(encode_keepalive(Lsn(8), 2, false)),
                ScriptEvent::EndOfStream,
            ],
            1,
        ));

        let mut conn = primary.connect("host=primary", "walrecv").await.unwrap();
        let accepted = conn
            .start_streaming(&StreamOptions {
                start: Lsn(0),
                timeline: 1,
                slot: None,
            })
            .await
            .unwrap();
        assert!(accepted);

        assert!(matches!(conn.try_receive().unwrap(), PollResult::Frame(_)));
        assert!(matches!(conn.try_receive().unwrap(), PollResult::Frame(_)));
        assert_eq!(conn.try_receive().unwrap(), PollResult::EndOfStream);
        // Stays at end-of-stream until end_streaming
        assert_eq!(conn.try_receive().unwrap(), PollResult::EndOfStream);
        assert_eq!(conn.end_streaming().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scripted_rejected_stream() {
        let mut primary = ScriptedPrimary::new(1, 2);
        primary.push_stream(StreamScript::rejected(2));
        let mut conn = primary.connect("host=primary", "walrecv").await.unwrap();
        let accepted = conn
            .start_streaming(&StreamOptions {
                start: Lsn(0),
                timeline: 1,
                slot: None,
            })
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_idle_delays_readable() {
        let mut primary = ScriptedPrimary::new(1, 1);
        primary.push_stream(StreamScript::new(
            vec![
                ScriptEvent::Idle(Duration::from_secs(5)),
                ScriptEvent::Frame(encode_keepalive(Lsn(0), 1, false)),
            ],
            1,
        ));
        let mut conn = primary.connect("host=primary", "walrecv").await.unwrap();
        conn.start_streaming(&StreamOptions {
            start: Lsn(0),
            timeline: 1,
            slot: None,
        })
        .await
        .unwrap();

        assert_eq!(conn.try_receive().unwrap(), PollResult::WouldBlock);
        let before = tokio::time::Instant::now();
        conn.readable().await;
        assert!(before.elapsed() >= Duration::from_secs(5));
        assert!(matches!(conn.try_receive().unwrap(), PollResult::Frame(_)));
    }

    #[tokio::test]
    async fn test_scripted_records_sent_messages() {
        let mut primary = ScriptedPrimary::new(1, 1);
        let mut conn = primary.connect("host=primary", "walrecv").await.unwrap();
        let msg = StandbyMessage::StatusUpdate {
            write: Lsn(16),
            flush: Lsn(8),
            apply: Lsn(0),
            send_time: 1,
            reply_requested: false,
        };
        conn.send(msg.encode()).await.unwrap();
        assert_eq!(primary.sent_messages(), vec![msg]);
    }
}
