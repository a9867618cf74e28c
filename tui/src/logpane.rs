//! Bounded ring buffer of log lines with partial-line carryover, pause
//! freezing, and clamped scrollback.

pub(crate) const DEFAULT_MAX_LOGS: usize = 500;

#[derive(Debug)]
pub(crate) struct LogPane {
    max_lines: usize,
    lines: Vec<String>,
    partial: String,
    scroll: usize,
    paused: bool,
    paused_len: usize,
    paused_partial: String,
}

impl LogPane {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            max_lines: if max == 0 { DEFAULT_MAX_LOGS } else { max },
            lines: Vec::new(),
            partial: String::new(),
            scroll: 0,
            paused: false,
            paused_len: 0,
            paused_partial: String::new(),
        }
    }

    /// Appends a chunk, splitting complete lines off and keeping the last
    /// partial line for the next chunk.
    pub(crate) fn append(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let chunk = chunk.replace("\r\n", "\n").replace('\r', "\n");
        let text = format!("{}{}", self.partial, chunk);
        let mut pieces: Vec<&str> = text.split('\n').collect();
        let last = pieces.pop().unwrap_or_default().to_string();
        for line in pieces {
            self.add_line(line.to_string());
        }
        self.partial = last;
    }

    fn add_line(&mut self, line: String) {
        self.lines.push(line);
        if self.lines.len() > self.max_lines {
            let drop = self.lines.len() - self.max_lines;
            self.lines.drain(..drop);
        }
        if self.paused && self.paused_len > self.lines.len() {
            self.paused_len = self.lines.len();
        }
        self.clamp_scroll();
    }

    fn clamp_scroll(&mut self) {
        let total = self.buffer_length();
        if total == 0 {
            self.scroll = 0;
            return;
        }
        self.scroll = self.scroll.min(total - 1);
    }

    pub(crate) fn flush_partial(&mut self) {
        if self.partial.is_empty() {
            return;
        }
        let partial = std::mem::take(&mut self.partial);
        self.add_line(partial);
    }

    /// The window of lines currently visible for a pane of `height` rows.
    pub(crate) fn visible(&self, height: usize) -> Vec<String> {
        if height == 0 {
            return Vec::new();
        }
        let data = self.current_data();
        if data.is_empty() {
            return Vec::new();
        }
        let end = data.len().saturating_sub(self.scroll);
        let start = end.saturating_sub(height);
        data[start..end].to_vec()
    }

    /// Positive deltas scroll toward older history.
    pub(crate) fn scroll_by(&mut self, delta: isize) {
        if delta == 0 {
            return;
        }
        self.scroll = self.scroll.saturating_add_signed(delta);
        self.clamp_scroll();
    }

    pub(crate) fn reset_scroll(&mut self) {
        self.scroll = 0;
    }

    /// Freezes the visible window at the current length; new lines keep
    /// accumulating behind it. Resuming snaps to the new bottom.
    pub(crate) fn set_paused(&mut self, paused: bool) -> bool {
        if self.paused == paused {
            return self.paused;
        }
        self.paused = paused;
        if paused {
            self.paused_len = self.lines.len();
            self.paused_partial = self.partial.clone();
        } else {
            self.paused_len = 0;
            self.paused_partial.clear();
        }
        self.clamp_scroll();
        self.paused
    }

    fn buffer_length(&self) -> usize {
        if self.paused {
            let limit = self.paused_len.min(self.lines.len());
            limit + usize::from(!self.paused_partial.is_empty())
        } else {
            self.lines.len() + usize::from(!self.partial.is_empty())
        }
    }

    fn current_data(&self) -> Vec<String> {
        if self.paused {
            let limit = self.paused_len.min(self.lines.len());
            let mut data = self.lines[..limit].to_vec();
            if !self.paused_partial.is_empty() {
                data.push(self.paused_partial.clone());
            }
            data
        } else {
            let mut data = self.lines.clone();
            if !self.partial.is_empty() {
                data.push(self.partial.clone());
            }
            data
        }
    }
}
