//! Durable Segment Storage
//!
//! Storage backends for fixed-size WAL segment files and the writer that
//! maps stream positions onto them.

pub mod store;
pub mod writer;

pub use store::{
    ArchiveDisposition, InMemorySegmentStore, LocalSegmentStore, SegmentFile, SegmentStore,
    WalIoError,
};
pub use writer::WalSegmentWriter;
