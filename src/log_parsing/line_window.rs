use std::collections::VecDeque;

/// Longest record the parser knows about, in lines.
pub const RECORD_LINES: usize = 3;

/// Sliding window over the most recent log lines.
///
/// Some relay records span several lines (a client challenge, an
/// allocation). The window hands the parser the newest line together with
/// the lines that preceded it.
#[derive(Debug)]
pub struct LineWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LineWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `line` and returns the current record text.
    pub fn push(&mut self, line: &str) -> String {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines
            .push_back(line.trim_end_matches(['\r', '\n']).to_string());
        self.record()
    }

    pub fn record(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

impl Default for LineWindow {
    fn default() -> Self {
        Self::new(RECORD_LINES)
    }
}
