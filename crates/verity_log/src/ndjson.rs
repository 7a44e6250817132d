//! NDJSON form of the event log (`logs/events.ndjson`).
//!
//! Writing always produces canonical lines. Reading keeps the raw text of
//! every line next to the parsed event so diff tooling can inspect exactly
//! what was stored.

use crate::event::Event;
use crate::log::{LogError, event_line};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// NDJSON errors
#[derive(Debug, thiserror::Error)]
pub enum NdjsonError {
    /// A line is not a valid event record
    #[error("line {line}: {message}")]
    InvalidLine {
        /// One-based line number
        line: usize,
        /// Parse failure
        message: String,
    },
    /// An event could not be encoded
    #[error(transparent)]
    Log(#[from] LogError),
}

/// An event together with the exact JSON text it was read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Parsed event
    pub event: Event,
    /// Stored JSON text
    pub raw: Box<RawValue>,
}

impl RecordedEvent {
    /// Raw JSON text of the stored line
    #[must_use]
    pub fn raw_text(&self) -> &str {
        self.raw.get()
    }
}

impl PartialEq for RecordedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.event == other.event && self.raw.get() == other.raw.get()
    }
}

/// Encode events as canonical NDJSON, one line per event
///
/// # Errors
///
/// Returns error if any event is not canonical
pub fn encode_ndjson(events: &[Event]) -> Result<String, NdjsonError> {
    let mut out = Vec::new();
    for event in events {
        out.extend(event_line(event)?);
        out.push(b'\n');
    }
    // Canonical lines are built from serde_json string output and ASCII
    // punctuation, so they are always UTF-8.
    String::from_utf8(out).map_err(|e| NdjsonError::InvalidLine {
        line: 0,
        message: e.to_string(),
    })
}

/// Decode NDJSON text, keeping each line's raw form. Blank lines are skipped.
///
/// # Errors
///
/// Returns error on the first line that is not a valid event
pub fn decode_ndjson(text: &str) -> Result<Vec<RecordedEvent>, NdjsonError> {
    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let invalid = |message: String| NdjsonError::InvalidLine {
            line: index + 1,
            message,
        };
        let raw = RawValue::from_string(trimmed.to_string()).map_err(|e| invalid(e.to_string()))?;
        let event: Event = serde_json::from_str(raw.get()).map_err(|e| invalid(e.to_string()))?;
        records.push(RecordedEvent { event, raw });
    }
    Ok(records)
}
