//! Reassembles chunked terminal output into display lines.
//!
//! Output frames split and merge line boundaries arbitrarily; this buffer
//! folds them back into an ordered, bounded list of lines. The last element
//! is always the current, possibly incomplete line.

use std::collections::VecDeque;

/// Display-retention bound: only the most recent lines are kept.
pub const MAX_LINES: usize = 500;

#[derive(Debug)]
pub struct LineBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::with_max_lines(MAX_LINES)
    }

    pub fn with_max_lines(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            max_lines,
        }
    }

    /// Fold one output fragment into the line list.
    ///
    /// `\r\n` and bare `\n` are equivalent terminators, including a pair
    /// split across two fragments. Concatenating all fragments and
    /// re-splitting yields the same lines as feeding them one at a time.
    pub fn push(&mut self, fragment: &str) {
        if fragment.is_empty() {
            return;
        }

        // Reprocess the incomplete tail together with the new fragment so a
        // terminator split across fragments is still one boundary.
        let mut current = self.lines.pop_back().unwrap_or_default();
        current.push_str(fragment);

        let mut rest = current.as_str();
        while let Some(pos) = rest.find('\n') {
            let body = rest[..pos].strip_suffix('\r').unwrap_or(&rest[..pos]);
            self.lines.push_back(body.to_string());
            rest = &rest[pos + 1..];
        }
        self.lines.push_back(rest.to_string());

        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    /// All retained lines in order; the last is the incomplete tail.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Whether any retained line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|l| l.contains(needle))
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}
