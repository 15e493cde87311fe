//! Bounded in-memory buffer for captured listener output.
//!
//! The supervisor keeps the most recent output lines of a captured listener
//! in a [`LogRing`]. When the ring is full the oldest line is dropped, so
//! memory use stays flat no matter how chatty the listener is. For listeners
//! whose output is redirected to a file instead, [`read_tail`] provides the
//! same last-n-lines view over the file.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Smallest permitted ring capacity.
const MIN_CAPACITY: usize = 10;

/// Largest permitted ring capacity.
const MAX_CAPACITY: usize = 10_000;

/// Default number of lines retained for a captured listener.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// A fixed-capacity ring of output lines.
///
/// Pushing onto a full ring evicts the oldest line. Lines are returned in
/// chronological order (oldest first).
#[derive(Debug)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    /// Creates a ring holding at most `capacity` lines.
    ///
    /// The capacity is clamped to a sane range so a typo in configuration
    /// cannot produce a zero-size or multi-gigabyte buffer.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(MIN_CAPACITY, MAX_CAPACITY);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a line, evicting the oldest if the ring is full.
    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Returns the last `n` lines in chronological order.
    ///
    /// Returns fewer than `n` lines if the ring holds fewer.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    /// Number of lines currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Returns `true` if no lines are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Discards all buffered lines.
    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Reads the last `n` lines of a log file in chronological order.
///
/// A missing file yields an empty result rather than an error, since a
/// listener that has never started has never written a log.
pub fn read_tail(path: &Path, n: usize) -> std::io::Result<Vec<String>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut ring = LogRing::new(n);
    for line in BufReader::new(file).lines() {
        ring.push(line?);
    }
    Ok(ring.tail(n))
}
