//! Segment Writer
//!
//! Turns stream-positioned WAL payloads into positional writes against
//! fixed-size segment files. The stream position alone dictates which
//! segment and which offset every byte lands at; the writer opens segments
//! on demand, splits payloads at segment boundaries, and closes completed
//! segments with a durability barrier and an archive marker before moving
//! on.
//!
//! Two positions are tracked: `write_pos` (everything handed to the OS)
//! and `flush_pos` (everything known durable). Flushing is explicit and
//! only performed when there is something new to make durable. A lock-free
//! copy of `write_pos` is published through an `Arc<AtomicU64>` so other
//! components can read the written-up-to hint without any lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ArchiveMode;
use crate::lsn::{segment_file_name, Lsn, SegmentNo, TimeLineId};
use crate::segment::store::{ArchiveDisposition, SegmentFile, SegmentStore, WalIoError};

struct OpenSegment<F> {
    seg_no: SegmentNo,
    file: F,
}

/// Writer for the stream of WAL bytes arriving on one timeline.
pub struct WalSegmentWriter<S: SegmentStore> {
    store: S,
    segment_size: u64,
    archive_mode: ArchiveMode,
    timeline: TimeLineId,
    current: Option<OpenSegment<S::File>>,
    write_pos: Lsn,
    flush_pos: Lsn,
    written_upto: Arc<AtomicU64>,
}

impl<S: SegmentStore> WalSegmentWriter<S> {
    pub fn new(store: S, segment_size: u64, archive_mode: ArchiveMode) -> Self {
        debug_assert!(
            segment_size > 0,
            "Precondition: segment size must be non-zero"
        );
        WalSegmentWriter {
            store,
            segment_size,
            archive_mode,
            timeline: 0,
            current: None,
            write_pos: Lsn(0),
            flush_pos: Lsn(0),
            written_upto: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Shared handle to the written-up-to hint. Updated after every write,
    /// readable without taking any lock.
    pub fn written_upto(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.written_upto)
    }

    /// Publish the written-up-to hint into an externally owned atomic,
    /// e.g. the shared status record's mirror.
    pub fn set_written_hint(&mut self, hint: Arc<AtomicU64>) {
        hint.store(self.write_pos.0, Ordering::Release);
        self.written_upto = hint;
    }

    /// Position up to which bytes have been handed to the OS.
    pub fn write_pos(&self) -> Lsn {
        self.write_pos
    }

    /// Position up to which bytes are known durable.
    pub fn flush_pos(&self) -> Lsn {
        self.flush_pos
    }

    /// Begin (or restart) an attempt at `start` on `timeline`. Received
    /// history before `start` is already durable elsewhere, so both
    /// positions reset to it.
    pub fn begin(&mut self, start: Lsn, timeline: TimeLineId) -> Result<(), WalIoError> {
        self.close_current()?;
        self.timeline = timeline;
        self.write_pos = start;
        self.flush_pos = start;
        self.written_upto.store(start.0, Ordering::Release);
        Ok(())
    }

    /// Write a payload starting at stream position `start`, splitting at
    /// segment boundaries and switching segments as the position dictates.
    pub fn write(&mut self, start: Lsn, data: &[u8]) -> Result<(), WalIoError> {
        let mut recptr = start;
        let mut remaining = data;

        while !remaining.is_empty() {
            let seg_no = recptr.segment_no(self.segment_size);

            // Leaving the current segment's range closes it first: flush,
            // close, archive marker, in that order.
            if let Some(open) = &self.current {
                if open.seg_no != seg_no {
                    self.close_completed_segment()?;
                }
            }

            let open = match &mut self.current {
                Some(open) => open,
                slot => {
                    let name = segment_file_name(self.timeline, seg_no, self.segment_size);
                    debug!(segment = %name, "opening WAL segment");
                    let file = self.store.open(&name, self.segment_size)?;
                    slot.insert(OpenSegment { seg_no, file })
                }
            };

            let startoff = recptr.segment_offset(self.segment_size);
            let segbytes = remaining
                .len()
                .min((self.segment_size - startoff) as usize);

            let written = open.file.write_at(&remaining[..segbytes], startoff)?;
            if written == 0 {
                return Err(WalIoError::ZeroLengthWrite {
                    name: segment_file_name(self.timeline, seg_no, self.segment_size),
                    offset: startoff,
                    length: segbytes,
                });
            }

            recptr = recptr.add(written as u64);
            remaining = &remaining[written..];

            self.write_pos = recptr;
            self.written_upto.store(recptr.0, Ordering::Release);
        }

        // A write ending exactly at a segment boundary completes that
        // segment; close it now rather than waiting for the next payload.
        if let Some(open) = &self.current {
            if self.write_pos.segment_offset(self.segment_size) == 0
                && self.write_pos.segment_no(self.segment_size) == open.seg_no + 1
            {
                self.close_completed_segment()?;
            }
        }

        Ok(())
    }

    /// Make everything written so far durable. Returns the new flush
    /// position if it advanced, `None` if there was nothing new to flush.
    pub fn flush(&mut self) -> Result<Option<Lsn>, WalIoError> {
        if self.write_pos <= self.flush_pos {
            return Ok(None);
        }
        if let Some(open) = &mut self.current {
            open.file.sync()?;
        }
        self.flush_pos = self.write_pos;
        Ok(Some(self.flush_pos))
    }

    /// Close whatever segment is open, flushing first. Used at the end of
    /// an attempt and at shutdown; no archive marker is written for a
    /// partially-filled segment.
    pub fn close_current(&mut self) -> Result<(), WalIoError> {
        self.flush()?;
        if let Some(open) = self.current.take() {
            open.file.close()?;
        }
        Ok(())
    }

    fn close_completed_segment(&mut self) -> Result<(), WalIoError> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };
        let mut open = open;

        // Completed segments are made durable before the marker appears,
        // so a marker never advertises bytes that could still be lost.
        if self.write_pos > self.flush_pos {
            open.file.sync()?;
            self.flush_pos = self.write_pos;
        }
        open.file.close()?;

        let name = segment_file_name(self.timeline, open.seg_no, self.segment_size);
        let disposition = match self.archive_mode {
            ArchiveMode::Always => ArchiveDisposition::Ready,
            ArchiveMode::On | ArchiveMode::Off => ArchiveDisposition::Done,
        };
        self.store.write_marker(&name, disposition)?;
        info!(segment = %name, ?disposition, "completed WAL segment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::store::InMemorySegmentStore;

    const SEG: u64 = 1024;

    fn writer(store: &InMemorySegmentStore) -> WalSegmentWriter<InMemorySegmentStore> {
        WalSegmentWriter::new(store.clone(), SEG, ArchiveMode::Off)
    }

    #[test]
    fn test_write_within_one_segment() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(100), 1).unwrap();

        w.write(Lsn(100), b"hello").unwrap();
        assert_eq!(w.write_pos(), Lsn(105));

        let data = store.segment_data("000000010000000000000000").unwrap();
        assert_eq!(&data[100..105], b"hello");
    }

    #[test]
    fn test_write_splits_at_segment_boundary() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        let start = Lsn(SEG - 3);
        w.begin(start, 1).unwrap();

        w.write(start, b"abcdef").unwrap();
        assert_eq!(w.write_pos(), Lsn(SEG + 3));

        let first = store.segment_data("000000010000000000000000").unwrap();
        let second = store.segment_data("000000010000000000000001").unwrap();
        assert_eq!(&first[(SEG - 3) as usize..], b"abc");
        assert_eq!(&second[..3], b"def");
    }

    #[test]
    fn test_completed_segment_gets_done_marker() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        // Crossing into segment 1 completes segment 0
        w.write(Lsn(0), &vec![7u8; SEG as usize + 1]).unwrap();
        assert_eq!(
            store.marker("000000010000000000000000"),
            Some(ArchiveDisposition::Done)
        );
        assert!(store.marker("000000010000000000000001").is_none());
    }

    #[test]
    fn test_archive_always_marks_ready() {
        let store = InMemorySegmentStore::new();
        let mut w = WalSegmentWriter::new(store.clone(), SEG, ArchiveMode::Always);
        w.begin(Lsn(0), 1).unwrap();

        w.write(Lsn(0), &vec![7u8; SEG as usize + 1]).unwrap();
        assert_eq!(
            store.marker("000000010000000000000000"),
            Some(ArchiveDisposition::Ready)
        );
    }

    #[test]
    fn test_exact_fill_closes_eagerly() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        w.write(Lsn(0), &vec![7u8; SEG as usize]).unwrap();
        assert_eq!(
            store.marker("000000010000000000000000"),
            Some(ArchiveDisposition::Done)
        );
        // Next segment not created yet
        assert!(!store.exists("000000010000000000000001"));
    }

    #[test]
    fn test_segment_close_flushes_before_marker() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        w.write(Lsn(0), &vec![9u8; SEG as usize + 4]).unwrap();
        // Segment 0 was completed, so its bytes must survive a crash
        store.simulate_crash();
        assert_eq!(
            store.synced_data("000000010000000000000000").unwrap(),
            vec![9u8; SEG as usize]
        );
        // Flush position advanced to the boundary, not past it
        assert_eq!(w.flush_pos(), Lsn(SEG));
        assert_eq!(w.write_pos(), Lsn(SEG + 4));
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        assert_eq!(w.flush().unwrap(), None);
        w.write(Lsn(0), b"abc").unwrap();
        assert_eq!(w.flush().unwrap(), Some(Lsn(3)));
        assert_eq!(w.flush().unwrap(), None);
        assert_eq!(store.sync_count(), 1);
    }

    #[test]
    fn test_short_writes_are_retried() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        store.limit_next_write(2);
        w.write(Lsn(0), b"abcdef").unwrap();
        assert_eq!(w.write_pos(), Lsn(6));
        assert_eq!(
            &store.segment_data("000000010000000000000000").unwrap()[..6],
            b"abcdef"
        );
    }

    #[test]
    fn test_zero_length_write_is_fatal() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();

        store.fail_next_write_with_zero();
        let err = w.write(Lsn(0), b"abc").unwrap_err();
        assert!(matches!(err, WalIoError::ZeroLengthWrite { .. }));
    }

    #[test]
    fn test_written_upto_hint_tracks_writes() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        let hint = w.written_upto();
        w.begin(Lsn(500), 1).unwrap();
        assert_eq!(hint.load(Ordering::Acquire), 500);

        w.write(Lsn(500), b"xyz").unwrap();
        assert_eq!(hint.load(Ordering::Acquire), 503);
    }

    #[test]
    fn test_begin_closes_previous_attempt() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();
        w.write(Lsn(0), b"old").unwrap();

        // New attempt on a newer timeline rewrites from its own start
        w.begin(Lsn(0), 2).unwrap();
        w.write(Lsn(0), b"new").unwrap();
        assert!(store.exists("000000020000000000000000"));
        assert_eq!(
            &store.segment_data("000000020000000000000000").unwrap()[..3],
            b"new"
        );
    }

    #[test]
    fn test_close_current_flushes() {
        let store = InMemorySegmentStore::new();
        let mut w = writer(&store);
        w.begin(Lsn(0), 1).unwrap();
        w.write(Lsn(0), b"shutdown").unwrap();
        w.close_current().unwrap();

        store.simulate_crash();
        assert_eq!(
            &store.segment_data("000000010000000000000000").unwrap()[..8],
            b"shutdown"
        );
        // Partial segment: no archive marker
        assert!(store.marker("000000010000000000000000").is_none());
    }
}
