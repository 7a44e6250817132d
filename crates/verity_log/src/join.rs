//! Join point for parallel workers.
//!
//! Workers record their outputs against a logical tick. The join orders by
//! `(tick, worker, local_seq)` and assigns global sequence numbers. Arrival
//! order is ignored entirely, so completion timing cannot leak into the log.

use crate::event::EventKind;
use crate::log::{EventLog, LogError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use verity_core::LogicalTime;

/// One event produced by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerOutput {
    /// Worker index
    pub worker: u32,
    /// Logical time the event was produced at
    pub tick: LogicalTime,
    /// Position within the worker's own output
    pub local_seq: u64,
    /// Event type
    pub kind: EventKind,
    /// Event payload
    pub payload: Value,
}

/// Join errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    /// Two outputs claim the same slot, so no total order exists
    #[error("worker {worker} emitted two outputs at {tick} with local sequence {local_seq}")]
    DuplicateSlot {
        /// Worker index
        worker: u32,
        /// Shared logical time
        tick: LogicalTime,
        /// Shared local sequence
        local_seq: u64,
    },
    /// The merged log ran out of sequence numbers
    #[error(transparent)]
    Log(#[from] LogError),
}

/// Merge worker outputs into one deterministic event log
///
/// # Errors
///
/// Returns error if two outputs share `(tick, worker, local_seq)`
pub fn join_worker_outputs(
    base: EventLog,
    mut outputs: Vec<WorkerOutput>,
) -> Result<EventLog, JoinError> {
    outputs.sort_by_key(|o| (o.tick, o.worker, o.local_seq));

    let mut seen = BTreeSet::new();
    for output in &outputs {
        if !seen.insert((output.tick, output.worker, output.local_seq)) {
            return Err(JoinError::DuplicateSlot {
                worker: output.worker,
                tick: output.tick,
                local_seq: output.local_seq,
            });
        }
    }

    let mut log = base;
    for output in outputs {
        log.append(output.kind, output.payload)?;
    }
    tracing::debug!(events = log.len(), "joined worker outputs");
    Ok(log)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(worker: u32, tick: u64, local_seq: u64) -> WorkerOutput {
        WorkerOutput {
            worker,
            tick: LogicalTime::from_raw(tick),
            local_seq,
            kind: EventKind::StepCompleted,
            payload: json!({"worker": worker, "tick": tick, "n": local_seq}),
        }
    }

    #[test]
    fn test_join_ignores_arrival_order() {
        let arrivals_a = vec![output(1, 0, 0), output(0, 0, 0), output(0, 1, 0), output(1, 1, 0)];
        let arrivals_b = vec![output(1, 1, 0), output(0, 1, 0), output(1, 0, 0), output(0, 0, 0)];

        let a = join_worker_outputs(EventLog::new(), arrivals_a).unwrap();
        let b = join_worker_outputs(EventLog::new(), arrivals_b).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        assert_eq!(a.events()[0].payload["worker"], 0);
        assert_eq!(a.events()[1].payload["worker"], 1);
    }

    #[test]
    fn test_join_continues_base_sequence() {
        let mut base = EventLog::new();
        base.append(EventKind::RunStarted, json!({})).unwrap();
        let joined = join_worker_outputs(base, vec![output(0, 0, 0)]).unwrap();
        assert_eq!(joined.events()[1].seq, 1);
    }

    #[test]
    fn test_duplicate_slot_rejected() {
        let err = join_worker_outputs(EventLog::new(), vec![output(0, 0, 0), output(0, 0, 0)]);
        assert!(matches!(err, Err(JoinError::DuplicateSlot { worker: 0, .. })));
    }
}
