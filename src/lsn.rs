//! Log Stream Positions and Segment Arithmetic
//!
//! An [`Lsn`] is a monotonically increasing logical byte offset into the
//! replicated log stream. Segment files slice that stream into fixed-size
//! chunks; a position maps to exactly one (segment number, intra-segment
//! offset) pair for a given segment size.
//!
//! Segment file names are deterministic: timeline + split segment number,
//! each as 8 uppercase hex digits. Timeline history files are named
//! `{tli:08X}.history`.

use std::fmt;

/// Identifier for a divergent history branch of the log stream.
/// Increases on failover/promotion. Timeline 1 is the initial timeline
/// and has no history file.
pub type TimeLineId = u32;

/// Sequential number of a log segment within the stream.
pub type SegmentNo = u64;

/// A logical byte position in the replicated log stream.
///
/// Displayed in the conventional split form `hi/lo` (two 32-bit halves in
/// hex), which is what operators grep for in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Construct from the split hi/lo representation used in history files.
    pub fn from_split(hi: u32, lo: u32) -> Self {
        Lsn(((hi as u64) << 32) | (lo as u64))
    }

    /// Segment number containing this position.
    pub fn segment_no(self, segment_size: u64) -> SegmentNo {
        debug_assert!(segment_size > 0, "Precondition: segment size must be non-zero");
        self.0 / segment_size
    }

    /// Byte offset of this position within its segment.
    pub fn segment_offset(self, segment_size: u64) -> u64 {
        self.0 % segment_size
    }

    /// True if this position falls inside the given segment.
    pub fn in_segment(self, seg_no: SegmentNo, segment_size: u64) -> bool {
        self.segment_no(segment_size) == seg_no
    }

    /// Position advanced by `n` bytes.
    pub fn add(self, n: u64) -> Self {
        debug_assert!(
            self.0.checked_add(n).is_some(),
            "Precondition: stream position must not overflow"
        );
        Lsn(self.0.wrapping_add(n))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl From<u64> for Lsn {
    fn from(v: u64) -> Self {
        Lsn(v)
    }
}

/// Segment file name for (timeline, segment number), given the segment size.
///
/// The segment number is split into two 32-bit halves relative to a 4GiB
/// stride, so names sort lexicographically in stream order regardless of
/// segment size.
pub fn segment_file_name(tli: TimeLineId, seg_no: SegmentNo, segment_size: u64) -> String {
    debug_assert!(segment_size > 0, "Precondition: segment size must be non-zero");
    let segments_per_id = 0x1_0000_0000u64 / segment_size;
    format!(
        "{:08X}{:08X}{:08X}",
        tli,
        seg_no / segments_per_id,
        seg_no % segments_per_id
    )
}

/// Timeline history file name for a timeline.
pub fn history_file_name(tli: TimeLineId) -> String {
    format!("{:08X}.history", tli)
}

/// Microseconds since the Unix epoch, the timestamp unit used on the wire
/// and in shared-status telemetry.
pub type TimestampMicros = i64;

/// Current wall-clock time in wire timestamp units.
pub fn now_micros() -> TimestampMicros {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: u64 = 16 * 1024 * 1024; // 16MiB

    #[test]
    fn test_segment_mapping() {
        assert_eq!(Lsn(0).segment_no(SEG), 0);
        assert_eq!(Lsn(0).segment_offset(SEG), 0);
        assert_eq!(Lsn(SEG - 1).segment_no(SEG), 0);
        assert_eq!(Lsn(SEG).segment_no(SEG), 1);
        assert_eq!(Lsn(SEG).segment_offset(SEG), 0);
        assert_eq!(Lsn(SEG * 3 + 42).segment_no(SEG), 3);
        assert_eq!(Lsn(SEG * 3 + 42).segment_offset(SEG), 42);
    }

    #[test]
    fn test_in_segment() {
        assert!(Lsn(SEG + 1).in_segment(1, SEG));
        assert!(!Lsn(SEG * 2).in_segment(1, SEG));
    }

    #[test]
    fn test_display_split_form() {
        assert_eq!(Lsn(0).to_string(), "0/0");
        assert_eq!(Lsn(0x0100_0000).to_string(), "0/1000000");
        assert_eq!(Lsn::from_split(2, 0x3000).to_string(), "2/3000");
    }

    #[test]
    fn test_from_split_roundtrip() {
        let lsn = Lsn::from_split(0xDEAD, 0xBEEF_0000);
        assert_eq!(lsn.0, 0x0000_DEAD_BEEF_0000);
    }

    #[test]
    fn test_segment_file_name() {
        // 16MiB segments: 256 segments per 4GiB id
        assert_eq!(segment_file_name(1, 0, SEG), "000000010000000000000000");
        assert_eq!(segment_file_name(1, 255, SEG), "0000000100000000000000FF");
        assert_eq!(segment_file_name(1, 256, SEG), "000000010000000100000000");
        assert_eq!(segment_file_name(3, 5, SEG), "000000030000000000000005");
    }

    #[test]
    fn test_history_file_name() {
        assert_eq!(history_file_name(2), "00000002.history");
        assert_eq!(history_file_name(0x1F), "0000001F.history");
    }
}
