//! Streaming Replication Protocol
//!
//! Frame codec for the four replication message kinds and the trait surface
//! of the connection collaborator that carries them.

pub mod connection;
pub mod message;

pub use connection::{
    ConnError, PollResult, PrimaryConnector, ScriptEvent, ScriptedConnection, ScriptedPrimary,
    StreamOptions, StreamScript, SystemIdentity, WalSenderConnection,
};
pub use message::{
    encode_keepalive, encode_wal_data, ProtocolError, StandbyMessage, WalSenderMessage,
    KEEPALIVE_LEN, WAL_DATA_HEADER_LEN,
};
