//! Timeline History Files
//!
//! A timeline history file lists, one line per ancestor timeline, the
//! position at which that timeline ended:
//!
//! ```text
//! <timelineId><TAB><hi>/<lo>
//! ```
//!
//! Blank lines and `#` comments are ignored. Timeline ids must appear in
//! strictly increasing order, and the target timeline must be greater than
//! every id listed. Parsing appends one entry for the target timeline
//! itself, whose `end` is open-ended.

use crate::lsn::{Lsn, TimeLineId};

/// One parsed line of a timeline history file, plus the synthesized entry
/// for the target timeline. `begin`/`end` are `None` when the range is
/// open-ended (the first entry's begin, the target entry's end); that is a
/// distinct state, not position zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineId,
    pub begin: Option<Lsn>,
    pub end: Option<Lsn>,
}

/// Error from parsing a timeline history file.
#[derive(Debug)]
pub enum HistoryParseError {
    /// Line did not match `<tli>\t<hi>/<lo>`.
    Syntax { line: String },
    /// Timeline ids must be in strictly increasing order.
    OutOfOrder { line: String, previous: TimeLineId },
    /// The target timeline must exceed every listed id.
    TargetNotNewest {
        target: TimeLineId,
        newest_listed: TimeLineId,
    },
}

impl std::fmt::Display for HistoryParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryParseError::Syntax { line } => {
                write!(f, "syntax error in history file: \"{}\"", line)
            }
            HistoryParseError::OutOfOrder { line, previous } => write!(
                f,
                "invalid data in history file: \"{}\": timeline ids must increase (previous was {})",
                line, previous
            ),
            HistoryParseError::TargetNotNewest {
                target,
                newest_listed,
            } => write!(
                f,
                "invalid data in history file: target timeline {} must be greater than newest listed timeline {}",
                target, newest_listed
            ),
        }
    }
}

impl std::error::Error for HistoryParseError {}

/// Parse a history file for `target_tli`.
///
/// Each listed entry's `begin` is the previous entry's `end`; the final,
/// synthesized entry covers the target timeline itself with an open end.
pub fn parse_timeline_history(
    content: &str,
    target_tli: TimeLineId,
) -> Result<Vec<TimelineHistoryEntry>, HistoryParseError> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut last_tli: Option<TimeLineId> = None;
    let mut prev_end: Option<Lsn> = None;

    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (tli, switchpoint) = parse_history_line(line).ok_or_else(|| {
            HistoryParseError::Syntax {
                line: raw_line.to_string(),
            }
        })?;

        if let Some(prev) = last_tli {
            if tli <= prev {
                return Err(HistoryParseError::OutOfOrder {
                    line: raw_line.to_string(),
                    previous: prev,
                });
            }
        }
        last_tli = Some(tli);

        entries.push(TimelineHistoryEntry {
            tli,
            begin: prev_end,
            end: Some(switchpoint),
        });
        prev_end = Some(switchpoint);
    }

    if let Some(newest) = last_tli {
        if target_tli <= newest {
            return Err(HistoryParseError::TargetNotNewest {
                target: target_tli,
                newest_listed: newest,
            });
        }
    }

    // The target timeline has no line of its own; it starts where the last
    // listed timeline ended and is still open.
    entries.push(TimelineHistoryEntry {
        tli: target_tli,
        begin: prev_end,
        end: None,
    });

    Ok(entries)
}

/// Parse `<tli>\t<hi>/<lo>` with hex halves. Trailing fields are ignored.
fn parse_history_line(line: &str) -> Option<(TimeLineId, Lsn)> {
    let mut fields = line.split_whitespace();
    let tli: TimeLineId = fields.next()?.parse().ok()?;
    let switchpoint = fields.next()?;
    let (hi, lo) = switchpoint.split_once('/')?;
    let hi = u32::from_str_radix(hi, 16).ok()?;
    let lo = u32::from_str_radix(lo, 16).ok()?;
    Some((tli, Lsn::from_split(hi, lo)))
}
