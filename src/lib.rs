pub mod config;
pub mod lsn;
pub mod protocol;
pub mod receiver;
pub mod segment;
pub mod timeline;

pub use config::{ArchiveMode, ReceiverConfig, ReceiverSettings, ReplicationSlot};
pub use lsn::{Lsn, TimeLineId};
pub use receiver::{ReceiverControl, ReceiverError, ReceiverState, WalReceiver, WalReceiverStatus};
