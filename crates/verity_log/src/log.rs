//! Append-only event log.
//!
//! The log assigns sequence numbers on append and hashes events in exactly
//! the order they were appended. It never re-sorts.

use crate::event::{Event, EventKind};
use serde_json::Value;
use verity_core::{CanonicalEncode, CanonicalError, Digest, DigestAlgorithm};

/// Event log errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogError {
    /// Sequence numbers must strictly increase
    #[error("sequence {got} at position {position} does not follow {previous}")]
    NonMonotonicSeq {
        /// Index of the offending event
        position: usize,
        /// Sequence number of the event before it
        previous: u64,
        /// Sequence number found
        got: u64,
    },
    /// An event could not be canonically encoded
    #[error("event {seq} is not canonical: {source}")]
    Canonical {
        /// Sequence number of the event
        seq: u64,
        /// Encoding failure
        #[source]
        source: CanonicalError,
    },
    /// The last event already holds the largest sequence number
    #[error("no sequence number follows {last}")]
    SeqOverflow {
        /// Sequence number of the last event
        last: u64,
    },
}

/// Ordered, append-only sequence of events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a log from already-sequenced events
    ///
    /// # Errors
    ///
    /// Returns error if sequence numbers do not strictly increase
    pub fn from_events(events: Vec<Event>) -> Result<Self, LogError> {
        for (position, pair) in events.windows(2).enumerate() {
            if pair[1].seq <= pair[0].seq {
                return Err(LogError::NonMonotonicSeq {
                    position: position + 1,
                    previous: pair[0].seq,
                    got: pair[1].seq,
                });
            }
        }
        Ok(Self { events })
    }

    /// Append an event, assigning the next sequence number
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SeqOverflow`] if the last event holds `u64::MAX`
    pub fn append(&mut self, kind: EventKind, payload: Value) -> Result<u64, LogError> {
        let seq = self.next_seq()?;
        self.events.push(Event::new(seq, kind).with_payload(payload));
        Ok(seq)
    }

    /// Sequence number the next append will receive
    ///
    /// # Errors
    ///
    /// Returns [`LogError::SeqOverflow`] if the last event holds `u64::MAX`
    pub fn next_seq(&self) -> Result<u64, LogError> {
        match self.events.last() {
            None => Ok(0),
            Some(last) => last
                .seq
                .checked_add(1)
                .ok_or(LogError::SeqOverflow { last: last.seq }),
        }
    }

    /// Events in append order
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no event was appended
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Take the events out of the log
    #[must_use]
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Digest of the NDJSON-equivalent stream
    ///
    /// # Errors
    ///
    /// Returns error if any event payload is not canonical
    pub fn hash(&self) -> Result<Digest, LogError> {
        event_log_hash(&self.events)
    }
}

/// Canonical line for one event
///
/// # Errors
///
/// Returns error if the payload cannot be canonicalized
pub fn event_line(event: &Event) -> Result<Vec<u8>, LogError> {
    event.canonical_bytes().map_err(|source| LogError::Canonical {
        seq: event.seq,
        source,
    })
}

/// Hash events as the bytes of their canonical NDJSON file: each event on
/// its own line, every line terminated by `\n`, in slice order.
///
/// # Errors
///
/// Returns error if any event is not canonical
pub fn event_log_hash(events: &[Event]) -> Result<Digest, LogError> {
    let mut lines: Vec<Vec<u8>> = Vec::with_capacity(events.len());
    for event in events {
        lines.push(event_line(event)?);
    }
    let mut parts: Vec<&[u8]> = Vec::with_capacity(lines.len() * 2);
    for line in &lines {
        parts.push(line);
        parts.push(b"\n");
    }
    Ok(DigestAlgorithm::Sha256.digest_parts(&parts))
}
