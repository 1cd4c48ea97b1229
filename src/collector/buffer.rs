use crate::record::LogRecord;
use crate::MAX_RECORDS_IN_MEMORY;
use std::collections::VecDeque;

/// The visible slice of the buffer for a viewport of a given height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    /// Records above the window (scrolled past).
    pub above: usize,
    /// Records below the window.
    pub below: usize,
}

/// Ordered, memory-bounded buffer of collected records, plus the scroll
/// state of a viewer looking at it.
///
/// Timestamps are the display sort key: a late-arriving record with an
/// older timestamp is inserted in order rather than appended. Eviction is
/// by arrival from the front, which approximates oldest-first closely
/// enough for a tail view.
#[derive(Debug)]
pub struct LogBuffer {
    records: VecDeque<LogRecord>,
    max_records: usize,

    scroll_offset: usize,
    anchor_bottom: bool,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(MAX_RECORDS_IN_MEMORY)
    }
}

impl LogBuffer {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: VecDeque::new(),
            max_records,
            scroll_offset: 0,
            // Keep the most recent record visible as new ones arrive.
            anchor_bottom: true,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    pub fn is_anchored_bottom(&self) -> bool {
        self.anchor_bottom
    }

    /// Append a batch, keeping timestamp order and enforcing the cap.
    /// Returns how many records were evicted from the front.
    pub fn push_batch(&mut self, batch: Vec<LogRecord>) -> usize {
        for record in batch {
            self.insert_ordered(record);
        }

        let mut evicted = 0;
        while self.records.len() > self.max_records {
            self.records.pop_front();
            evicted += 1;
        }

        // Shift the viewport by the eviction count so the visible window
        // does not jump when the front moves.
        if evicted > 0 && !self.anchor_bottom {
            self.scroll_offset = self.scroll_offset.saturating_sub(evicted);
        }

        evicted
    }

    fn insert_ordered(&mut self, record: LogRecord) {
        // Records almost always arrive in order; scan from the back for
        // the rare out-of-order case.
        let mut idx = self.records.len();
        while idx > 0 && self.records[idx - 1].timestamp > record.timestamp {
            idx -= 1;
        }
        if idx == self.records.len() {
            self.records.push_back(record);
        } else {
            self.records.insert(idx, record);
        }
    }

    /// Compute the visible window for a viewport `height` records tall.
    pub fn window(&self, height: usize) -> Window {
        let len = self.records.len();
        let (start, end) = if self.anchor_bottom {
            (len.saturating_sub(height), len)
        } else {
            let start = self.scroll_offset.min(len.saturating_sub(1));
            (start, len.min(start + height))
        };

        Window {
            start,
            end,
            above: start,
            below: len - end,
        }
    }

    pub fn visible<'a>(&'a self, height: usize) -> impl Iterator<Item = &'a LogRecord> {
        let window = self.window(height);
        self.records.range(window.start..window.end)
    }

    pub fn scroll_down(&mut self, lines: usize, height: usize) {
        let max_offset = self.records.len().saturating_sub(height);
        self.scroll_offset = (self.scroll_offset + lines).min(max_offset);
        self.update_anchor(height);
    }

    pub fn scroll_up(&mut self, lines: usize, height: usize) {
        // Scrolling up from the anchored tail starts from the bottom
        // window, not from a stale offset.
        if self.anchor_bottom {
            self.scroll_offset = self.records.len().saturating_sub(height);
        }
        self.scroll_offset = self.scroll_offset.saturating_sub(lines);
        self.update_anchor(height);
    }

    pub fn scroll_to_top(&mut self, height: usize) {
        self.scroll_offset = 0;
        self.update_anchor(height);
    }

    pub fn scroll_to_bottom(&mut self, height: usize) {
        self.scroll_offset = self.records.len().saturating_sub(height);
        self.update_anchor(height);
    }

    fn update_anchor(&mut self, height: usize) {
        // Anchored whenever the last record is inside the window.
        self.anchor_bottom = self.scroll_offset + height >= self.records.len();
    }
}
