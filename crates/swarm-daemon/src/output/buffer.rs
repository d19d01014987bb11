//! Bounded line buffer with absolute offsets.
//!
//! Offsets count every line ever appended to the buffer, so they stay valid
//! after the oldest lines have been evicted. Reading an evicted range returns
//! whatever is still retained instead of failing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Which pipe a line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub agent: String,
    pub stream: StreamKind,
    pub text: String,
    /// Unix seconds at which the line was read.
    pub timestamp: i64,
}

/// Result of a paginated read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputPage {
    pub lines: Vec<OutputLine>,
    /// Absolute offset of the first returned line.
    pub offset: i64,
    /// Offset to pass on the next read.
    pub next_offset: i64,
    /// Lines currently retained by the buffer.
    pub total: usize,
    pub has_more: bool,
}

/// FIFO ring of output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    evicted: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            evicted: 0,
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn push(&mut self, line: OutputLine) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Absolute offset of the oldest retained line.
    pub fn first_offset(&self) -> i64 {
        i64::try_from(self.evicted).unwrap_or(i64::MAX)
    }

    /// Absolute offset one past the newest line.
    pub fn end_offset(&self) -> i64 {
        self.first_offset()
            .saturating_add(i64::try_from(self.lines.len()).unwrap_or(i64::MAX))
    }

    /// Read up to `limit` lines starting at `offset`.
    ///
    /// A negative `offset` reads the tail: the last `|offset|` lines. An
    /// offset at or past the end yields an empty page whose `next_offset`
    /// echoes the request. `limit` is clamped to `[0, capacity]`.
    pub fn read(&self, offset: i64, limit: i64) -> OutputPage {
        let first = self.first_offset();
        let end = self.end_offset();
        let limit = limit.clamp(0, i64::try_from(self.capacity).unwrap_or(i64::MAX));

        if offset >= end {
            return OutputPage {
                lines: Vec::new(),
                offset,
                next_offset: offset,
                total: self.lines.len(),
                has_more: false,
            };
        }

        let start = if offset < 0 {
            end.saturating_add(offset).max(first)
        } else {
            offset.max(first)
        };
        let stop = start.saturating_add(limit).min(end);

        let from = usize::try_from(start - first).unwrap_or(0);
        let to = usize::try_from(stop - first).unwrap_or(from);
        let lines = self.lines.range(from..to).cloned().collect();

        OutputPage {
            lines,
            offset: start,
            next_offset: stop,
            total: self.lines.len(),
            has_more: stop < end,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn line(text: &str) -> OutputLine {
        OutputLine {
            agent: "alpha".to_string(),
            stream: StreamKind::Stdout,
            text: text.to_string(),
            timestamp: 0,
        }
    }

    fn filled(capacity: usize, count: usize) -> OutputBuffer {
        let mut buf = OutputBuffer::new(capacity);
        for i in 0..count {
            buf.push(line(&format!("line {i}")));
        }
        buf
    }

    fn texts(page: &OutputPage) -> Vec<&str> {
        page.lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn full_read_returns_lines_in_order() {
        let buf = filled(10, 4);
        let page = buf.read(0, 4);
        assert_eq!(texts(&page), vec!["line 0", "line 1", "line 2", "line 3"]);
        assert_eq!(page.offset, 0);
        assert_eq!(page.next_offset, 4);
        assert_eq!(page.total, 4);
        assert!(!page.has_more);
    }

    #[test]
    fn paginates_with_has_more() {
        let buf = filled(10, 5);
        let first = buf.read(0, 2);
        assert_eq!(texts(&first), vec!["line 0", "line 1"]);
        assert!(first.has_more);

        let second = buf.read(first.next_offset, 2);
        assert_eq!(texts(&second), vec!["line 2", "line 3"]);

        let third = buf.read(second.next_offset, 2);
        assert_eq!(texts(&third), vec!["line 4"]);
        assert!(!third.has_more);
        assert_eq!(third.next_offset, 5);
    }

    #[test]
    fn offset_past_end_is_empty_and_echoed() {
        let buf = filled(10, 3);
        for offset in [3, 4, 100] {
            let page = buf.read(offset, 10);
            assert!(page.lines.is_empty());
            assert!(!page.has_more);
            assert_eq!(page.next_offset, offset);
        }
    }

    #[test]
    fn negative_offset_reads_tail() {
        let buf = filled(10, 6);
        let page = buf.read(-2, 10);
        assert_eq!(texts(&page), vec!["line 4", "line 5"]);
        assert_eq!(page.offset, 4);
        assert_eq!(page.next_offset, 6);

        let whole = buf.read(-50, 10);
        assert_eq!(whole.lines.len(), 6);
        assert_eq!(whole.offset, 0);
    }

    #[test]
    fn tail_of_empty_buffer_is_empty() {
        let buf = OutputBuffer::new(4);
        let page = buf.read(-5, 10);
        assert!(page.lines.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.next_offset, 0);
    }

    #[test]
    fn eviction_keeps_offsets_absolute() {
        let buf = filled(3, 5);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.first_offset(), 2);
        assert_eq!(buf.end_offset(), 5);

        // Requested range partially evicted: shorter result, no error.
        let page = buf.read(0, 3);
        assert_eq!(texts(&page), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(page.offset, 2);
        assert_eq!(page.total, 3);

        let page = buf.read(4, 3);
        assert_eq!(texts(&page), vec!["line 4"]);
    }

    #[test]
    fn limit_is_clamped() {
        let buf = filled(4, 4);
        let page = buf.read(0, 1_000);
        assert_eq!(page.lines.len(), 4);

        let page = buf.read(0, -3);
        assert!(page.lines.is_empty());
        assert_eq!(page.next_offset, 0);
        assert!(page.has_more);
    }
}
