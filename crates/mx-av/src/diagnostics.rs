//! Bounded capture of engine output.

use std::collections::VecDeque;

/// Longest single line kept; longer lines are cut.
const MAX_LINE_BYTES: usize = 512;

/// Ring of the most recent output lines of one engine invocation.
#[derive(Debug, Clone)]
pub struct DiagnosticRing {
    capacity: usize,
    lines: VecDeque<String>,
    dropped: usize,
}

impl DiagnosticRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: VecDeque::with_capacity(capacity),
            dropped: 0,
        }
    }

    /// Record a line, evicting the oldest one when full. Blank lines are
    /// ignored.
    pub fn push(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(truncate_to(line, MAX_LINE_BYTES).to_string());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Number of lines evicted so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }

    /// The newest lines joined with `\n`, keeping at most `max_bytes` from
    /// the end.
    pub fn excerpt(&self, max_bytes: usize) -> String {
        let joined = self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n");
        tail(&joined, max_bytes)
    }
}

/// Keep the last `max_bytes` of `text`, cut on a char boundary and marked
/// with a leading ellipsis when shortened.
pub fn tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("…{}", &text[start..])
}

fn truncate_to(line: &str, max_bytes: usize) -> &str {
    if line.len() <= max_bytes {
        return line;
    }
    let mut end = max_bytes;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
