use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which output stream a log line was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Unknown,
}

impl StreamKind {
    /// Parse a server-reported stream label. Anything unrecognized
    /// (including the empty string) maps to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "stdout" => StreamKind::Stdout,
            "stderr" => StreamKind::Stderr,
            _ => StreamKind::Unknown,
        }
    }
}

/// One observed log line from any source.
///
/// `id` is stable across repeated fetches of the same underlying event
/// (re-fetch, reconnection), so dedup state can discard repeats without
/// discarding legitimately new events that merely share a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique identifier used for deduplication. Derivation is
    /// source-specific: server-issued where available, synthesized
    /// from timestamp + content otherwise.
    pub id: String,

    /// Source-reported creation time. Display sort key and the basis
    /// for watermark cursor advancement.
    pub timestamp: DateTime<Utc>,

    /// The literal text to display.
    pub content: String,

    pub stream: StreamKind,

    /// Source-specific context (run id, container id/name, build status,
    /// line number, stage). Opaque to the collector; carried through for
    /// display and filtering layers.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl LogRecord {
    /// Convenience accessor for a string metadata field.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}
