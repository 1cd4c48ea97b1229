use regex::Regex;

/// Splits raw streamed log payloads into displayable lines.
///
/// Remote build tooling redraws progress bars with ANSI cursor movement
/// and bare carriage returns. Left untouched, those payloads would
/// overwrite one another in the viewer instead of appearing as discrete
/// records, so each redraw is turned into its own line here.
#[derive(Debug)]
pub struct PayloadCleaner {
    cursor_movement: Regex,
    process_prefix: Regex,
}

impl Default for PayloadCleaner {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadCleaner {
    pub fn new() -> Self {
        Self {
            // Cursor up/down/forward/back sequences used for progress-bar
            // redraws. Color codes are left alone for the display layer.
            cursor_movement: Regex::new(r"\x1b\[[0-9]*[A-D]").expect("static regex"),
            // A worker prefix like "(Worker pid=7)" with no payload after
            // it, an artifact of splitting redrawn progress lines.
            process_prefix: Regex::new(r"^\s*\([^)]*pid=\d+\)\s*$").expect("static regex"),
        }
    }

    /// Strip cursor-movement sequences, normalize carriage returns to
    /// newlines, and split into parts. Blank parts and bare process
    /// prefixes are discarded, so one inbound payload can yield 0..N lines.
    pub fn clean_and_split(&self, content: &str) -> Vec<String> {
        let cleaned = self.cursor_movement.replace_all(content, "");
        let normalized = cleaned.replace('\r', "\n");

        normalized
            .split('\n')
            .filter(|part| !part.trim().is_empty() && !self.is_bare_process_prefix(part))
            .map(|part| part.to_string())
            .collect()
    }

    fn is_bare_process_prefix(&self, part: &str) -> bool {
        self.process_prefix.is_match(part)
    }
}
