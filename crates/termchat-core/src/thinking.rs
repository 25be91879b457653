//! Hides a leading reasoning block from a streamed reply.

use std::sync::LazyLock;

use regex::Regex;

/// Non-blank characters to see before deciding there is no reasoning block
pub const LOOKAHEAD: usize = 10;

const OPENING_MARKERS: [&str; 2] = ["<think", "<|think"];

static CLOSING_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</think(?:ing)?>|<\|think(?:ing)?\|>").expect("closing marker pattern")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Undetermined,
    Thinking,
    Visible,
}

enum Opening {
    Matched(usize),
    Possible,
    Impossible,
}

/// Per-request streaming state: everything received so far and how much of it
/// may be shown.
#[derive(Debug, Default, Clone)]
pub struct StreamState {
    accumulated: String,
    thinking_active: bool,
    thinking_resolved: bool,
    /// First byte of the visible answer
    visible_start: usize,
    /// End of the text handed out so far
    released: usize,
    /// Where the closing-marker search starts (just past the opening marker)
    scan_from: usize,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.thinking_active {
            Phase::Thinking
        } else if self.thinking_resolved {
            Phase::Visible
        } else {
            Phase::Undetermined
        }
    }

    /// Text released so far.
    pub fn visible(&self) -> &str {
        &self.accumulated[self.visible_start..self.released]
    }

    /// Add a delta and return whatever newly became visible (often empty).
    pub fn push(&mut self, delta: &str) -> &str {
        let before = self.released;
        self.accumulated.push_str(delta);

        if self.phase() == Phase::Undetermined {
            self.detect_opening();
        }
        if self.phase() == Phase::Thinking {
            self.find_closing();
        }

        match self.phase() {
            Phase::Visible => self.released = self.accumulated.len(),
            Phase::Undetermined => {
                if matches!(self.opening(), Opening::Impossible) {
                    self.released = self.accumulated.len();
                }
            }
            Phase::Thinking => {}
        }

        &self.accumulated[before.max(self.visible_start)..self.released]
    }

    /// End of stream: release text still held back while undetermined.
    ///
    /// An unclosed reasoning block stays hidden.
    pub fn finish(&mut self) -> &str {
        let before = self.released;
        if self.phase() == Phase::Undetermined {
            self.thinking_resolved = true;
            self.released = self.accumulated.len();
        }
        &self.accumulated[before.max(self.visible_start)..self.released]
    }

    fn leading_blank(&self) -> usize {
        self.accumulated.len() - self.accumulated.trim_start().len()
    }

    fn opening(&self) -> Opening {
        let lead = self.leading_blank();
        let trimmed = self.accumulated[lead..].as_bytes();
        let mut possible = false;

        for marker in OPENING_MARKERS {
            let marker = marker.as_bytes();
            if trimmed.len() >= marker.len() {
                if trimmed[..marker.len()].eq_ignore_ascii_case(marker) {
                    return Opening::Matched(lead + marker.len());
                }
            } else if marker[..trimmed.len()].eq_ignore_ascii_case(trimmed) {
                possible = true;
            }
        }

        if possible {
            Opening::Possible
        } else {
            Opening::Impossible
        }
    }

    fn detect_opening(&mut self) {
        match self.opening() {
            Opening::Matched(end) => {
                self.thinking_active = true;
                self.scan_from = end;
            }
            Opening::Possible | Opening::Impossible => {
                let seen = self.accumulated.trim_start().chars().count();
                if seen > LOOKAHEAD {
                    self.thinking_resolved = true;
                }
            }
        }
    }

    fn find_closing(&mut self) {
        if let Some(found) = CLOSING_MARKER.find_at(&self.accumulated, self.scan_from) {
            self.thinking_active = false;
            self.thinking_resolved = true;
            self.visible_start = found.end();
            self.released = found.end();
        }
    }
}
