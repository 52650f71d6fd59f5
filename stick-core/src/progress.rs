//! Turning dd's free-form status text into a byte count and a fraction.
//!
//! `dd status=progress` rewrites one line with carriage returns and prints a
//! final summary terminated by a newline. The stream reaches us in arbitrary
//! chunks, so [`StatusLines`] reassembles records before they are handed to
//! the stateless [`extract_bytes_written`].

use once_cell::sync::Lazy;
use regex::Regex;

static BYTES_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+) bytes").expect("valid regex"));

/// Pulls the byte count out of a dd status record.
///
/// Returns `None` for records without a `<digits> bytes` run, and for digit
/// runs that do not fit a `u64`.
pub fn extract_bytes_written(line: &str) -> Option<u64> {
    let caps = BYTES_RE.captures(line)?;
    caps.get(1)?.as_str().parse::<u64>().ok()
}

/// Splits a byte stream into status records on `\r` and `\n`.
///
/// Incomplete trailing text is kept until the next chunk or [`finish`].
///
/// [`finish`]: StatusLines::finish
#[derive(Debug, Default)]
pub struct StatusLines {
    pending: String,
}

impl StatusLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the records it completed, in stream order.
    /// Empty records are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut records = Vec::new();
        while let Some(pos) = self.pending.find(['\r', '\n']) {
            let record: String = self.pending.drain(..=pos).collect();
            let record = record.trim_end_matches(['\r', '\n']);
            if !record.trim().is_empty() {
                records.push(record.to_string());
            }
        }
        records
    }

    /// Returns whatever is left once the stream has hung up.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() { None } else { Some(rest) }
    }
}

/// Monotonic progress of one flash attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressTracker {
    total: u64,
    written: u64,
    finished: bool,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            written: 0,
            finished: false,
        }
    }

    /// Records a parsed byte count. Counts lower than the current one are
    /// ignored. Returns whether the displayed value changed.
    pub fn observe(&mut self, bytes: u64) -> bool {
        if bytes > self.written {
            self.written = bytes;
            true
        } else {
            false
        }
    }

    /// Marks the whole image as written.
    pub fn complete(&mut self) {
        self.written = self.written.max(self.total);
        self.finished = true;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// `bytes_written / total`, clamped to `[0.0, 1.0]`. An empty image has no
    /// meaningful ratio and reports 0 until completion.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return if self.finished { 1.0 } else { 0.0 };
        }
        (self.written as f64 / self.total as f64).clamp(0.0, 1.0)
    }

    /// Whole percent, truncated.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return if self.finished { 100 } else { 0 };
        }
        let percent = u128::from(self.written) * 100 / u128::from(self.total);
        percent.min(100) as u8
    }

    /// dd has reported every byte but `conv=fsync` is still flushing.
    pub fn is_syncing(&self) -> bool {
        self.total > 0 && self.percent() >= 100
    }
}
