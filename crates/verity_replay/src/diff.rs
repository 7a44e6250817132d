//! Comparing two stored runs and diagnosing why they differ.
//!
//! Diagnosis is advisory. It names the most likely cause of a divergence
//! but never changes whether runs match.

use crate::error::ReplayError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use verity_core::RunId;
use verity_log::{Event, RecordedEvent, RunManifest, log::event_line};

/// Likely cause of a divergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Diagnosis {
    /// Same values, object keys written in a different order
    MapIteration,
    /// Same values once arrays are sorted
    ArrayOrder,
    /// Runs emitted a different number of events
    EventCountMismatch,
    /// Same event log, different output
    OutputNondeterministic,
}

impl Diagnosis {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MapIteration => "map-iteration",
            Self::ArrayOrder => "array-order",
            Self::EventCountMismatch => "event-count-mismatch",
            Self::OutputNondeterministic => "output-nondeterministic",
        }
    }

    /// Hint shown next to the diagnosis
    #[must_use]
    pub const fn hint(&self) -> &'static str {
        match self {
            Self::MapIteration => "iterate maps in sorted key order before emitting",
            Self::ArrayOrder => "sort the array or declare its path as an unordered set",
            Self::EventCountMismatch => "look for conditional steps or retries that depend on timing",
            Self::OutputNondeterministic => "the output reads state that is not in the event log",
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON structure with object key order as written
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Shape {
    Object(IndexMap<String, Shape>),
    Array(Vec<Shape>),
    Scalar(serde::de::IgnoredAny),
}

impl Shape {
    fn key_paths(&self, prefix: &str, out: &mut Vec<String>) {
        match self {
            Self::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    out.push(path.clone());
                    child.key_paths(&path, out);
                }
            }
            Self::Array(items) => {
                for (i, child) in items.iter().enumerate() {
                    child.key_paths(&format!("{prefix}[{i}]"), out);
                }
            }
            Self::Scalar(_) => {}
        }
    }
}

fn key_paths(raw: &str) -> Option<Vec<String>> {
    let shape: Shape = serde_json::from_str(raw).ok()?;
    let mut out = Vec::new();
    shape.key_paths("", &mut out);
    Some(out)
}

/// Whether two JSON texts hold the same keys written in a different order
#[must_use]
pub fn key_order_differs(raw_a: &str, raw_b: &str) -> bool {
    let (Some(a), Some(b)) = (key_paths(raw_a), key_paths(raw_b)) else {
        return false;
    };
    if a == b {
        return false;
    }
    let mut sorted_a = a;
    let mut sorted_b = b;
    sorted_a.sort();
    sorted_b.sort();
    sorted_a == sorted_b
}

fn sort_arrays(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut sorted: Vec<Value> = items.iter().map(sort_arrays).collect();
            sorted.sort_by_cached_key(Value::to_string);
            Value::Array(sorted)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sort_arrays(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whether two values are equal once every array is sorted
#[must_use]
pub fn equal_up_to_array_order(a: &Value, b: &Value) -> bool {
    a != b && sort_arrays(a) == sort_arrays(b)
}

/// Diagnose a single pair of differing events
#[must_use]
pub fn diagnose_event_pair(a: &Value, b: &Value, raw: Option<(&str, &str)>) -> Option<Diagnosis> {
    if a == b {
        return raw
            .filter(|(ra, rb)| key_order_differs(ra, rb))
            .map(|_| Diagnosis::MapIteration);
    }
    if equal_up_to_array_order(a, b) {
        return Some(Diagnosis::ArrayOrder);
    }
    None
}

/// Paths at which two values differ. Arrays of different length report
/// the array path itself.
#[must_use]
pub fn diff_paths(a: &Value, b: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_diff_paths(a, b, "", &mut out);
    out
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn collect_diff_paths(a: &Value, b: &Value, prefix: &str, out: &mut Vec<String>) {
    match (a, b) {
        (Value::Object(ma), Value::Object(mb)) => {
            let keys: std::collections::BTreeSet<&String> = ma.keys().chain(mb.keys()).collect();
            for key in keys {
                let path = join_path(prefix, key);
                match (ma.get(key), mb.get(key)) {
                    (Some(va), Some(vb)) => collect_diff_paths(va, vb, &path, out),
                    _ => out.push(path),
                }
            }
        }
        (Value::Array(xa), Value::Array(xb)) if xa.len() == xb.len() => {
            for (i, (va, vb)) in xa.iter().zip(xb).enumerate() {
                collect_diff_paths(va, vb, &format!("{prefix}[{i}]"), out);
            }
        }
        _ if a == b => {}
        _ => out.push(if prefix.is_empty() {
            "$".to_string()
        } else {
            prefix.to_string()
        }),
    }
}

/// Index of the first event whose canonical line differs, counting a
/// missing event on either side as a difference
///
/// # Errors
///
/// Returns error if an event cannot be canonicalized
pub fn first_divergent_index(a: &[Event], b: &[Event]) -> Result<Option<usize>, ReplayError> {
    for i in 0..a.len().max(b.len()) {
        match (a.get(i), b.get(i)) {
            (Some(ea), Some(eb)) => {
                if event_line(ea)? != event_line(eb)? {
                    return Ok(Some(i));
                }
            }
            _ => return Ok(Some(i)),
        }
    }
    Ok(None)
}

/// A stored run as seen by diff tooling
#[derive(Debug, Clone, Copy)]
pub struct RunView<'a> {
    pub manifest: &'a RunManifest,
    pub events: &'a [RecordedEvent],
}

/// One row of the field table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMatch {
    pub field: String,
    pub a: String,
    pub b: String,
    #[serde(rename = "match")]
    pub matches: bool,
}

/// First point where two event logs differ
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDiff {
    pub first_divergent_index: u64,
    pub event_a: Option<Value>,
    pub event_b: Option<Value>,
    /// Payload paths that differ
    pub paths: Vec<String>,
}

/// Result of comparing two runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiff {
    pub run_a: RunId,
    pub run_b: RunId,
    pub identical: bool,
    pub fields: Vec<FieldMatch>,
    pub event_diff: Option<EventDiff>,
    pub diagnosis: Option<Diagnosis>,
}

fn row(field: &str, a: impl ToString, b: impl ToString) -> FieldMatch {
    let (a, b) = (a.to_string(), b.to_string());
    FieldMatch {
        field: field.to_string(),
        matches: a == b,
        a,
        b,
    }
}

fn join_cids(manifest: &RunManifest) -> String {
    manifest
        .artifact_hashes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn event_value(record: Option<&RecordedEvent>) -> Option<Value> {
    record.and_then(|r| serde_json::to_value(&r.event).ok())
}

fn find_event_diff(a: &[RecordedEvent], b: &[RecordedEvent]) -> Result<Option<EventDiff>, ReplayError> {
    let events_a: Vec<Event> = a.iter().map(|r| r.event.clone()).collect();
    let events_b: Vec<Event> = b.iter().map(|r| r.event.clone()).collect();

    // Canonical differences first; key order only when nothing else differs.
    let index = match first_divergent_index(&events_a, &events_b)? {
        Some(i) => Some(i),
        None => a
            .iter()
            .zip(b)
            .position(|(ra, rb)| key_order_differs(ra.raw_text(), rb.raw_text())),
    };
    let Some(index) = index else {
        return Ok(None);
    };

    let event_a = event_value(a.get(index));
    let event_b = event_value(b.get(index));
    let paths = match (&event_a, &event_b) {
        (Some(va), Some(vb)) => diff_paths(va, vb),
        _ => Vec::new(),
    };
    Ok(Some(EventDiff {
        first_divergent_index: index as u64,
        event_a,
        event_b,
        paths,
    }))
}

/// Compare two stored runs field by field and event by event
///
/// # Errors
///
/// Returns error if an event cannot be canonicalized
pub fn diff_runs(a: RunView<'_>, b: RunView<'_>) -> Result<RunDiff, ReplayError> {
    let (ma, mb) = (a.manifest, b.manifest);
    let fields = vec![
        row("engine_version", ma.engine_version, mb.engine_version),
        row("policy_version", &ma.policy_version, &mb.policy_version),
        row("input_hash", &ma.input_hash, &mb.input_hash),
        row("event_count", ma.event_count, mb.event_count),
        row("event_log_hash", &ma.event_log_hash, &mb.event_log_hash),
        row("output_hash", &ma.output_hash, &mb.output_hash),
        row("artifact_hashes", join_cids(ma), join_cids(mb)),
        row("fingerprint", &ma.fingerprint, &mb.fingerprint),
    ];
    let identical = fields.iter().all(|f| f.matches);
    let event_diff = find_event_diff(a.events, b.events)?;

    let diagnosis = if ma.event_count != mb.event_count || a.events.len() != b.events.len() {
        Some(Diagnosis::EventCountMismatch)
    } else if ma.event_log_hash == mb.event_log_hash && ma.output_hash != mb.output_hash {
        Some(Diagnosis::OutputNondeterministic)
    } else {
        event_diff.as_ref().and_then(|diff| {
            let index = usize::try_from(diff.first_divergent_index).ok()?;
            let (ra, rb) = (a.events.get(index)?, b.events.get(index)?);
            let (va, vb) = (diff.event_a.as_ref()?, diff.event_b.as_ref()?);
            diagnose_event_pair(va, vb, Some((ra.raw_text(), rb.raw_text())))
        })
    };

    tracing::debug!(
        run_a = %ma.run_id,
        run_b = %mb.run_id,
        identical,
        diagnosis = diagnosis.map(|d| d.as_str()),
        "diffed runs"
    );

    Ok(RunDiff {
        run_a: ma.run_id.clone(),
        run_b: mb.run_id.clone(),
        identical,
        fields,
        event_diff,
        diagnosis,
    })
}

impl RunDiff {
    /// Plain-text table for terminals
    #[must_use]
    pub fn render_table(&self) -> String {
        let mut out = format!("run a: {}\nrun b: {}\n\n", self.run_a, self.run_b);
        out.push_str(&format!("{:<16} {:<5} {}\n", "FIELD", "MATCH", "VALUES"));
        for f in &self.fields {
            let mark = if f.matches { "yes" } else { "NO" };
            if f.matches {
                out.push_str(&format!("{:<16} {:<5} {}\n", f.field, mark, f.a));
            } else {
                out.push_str(&format!("{:<16} {:<5} a={} b={}\n", f.field, mark, f.a, f.b));
            }
        }
        if let Some(diff) = &self.event_diff {
            out.push_str(&format!(
                "\nfirst divergent event: {}\n",
                diff.first_divergent_index
            ));
            for path in &diff.paths {
                out.push_str(&format!("  differs at {path}\n"));
            }
        }
        if let Some(diagnosis) = self.diagnosis {
            out.push_str(&format!("diagnosis: {diagnosis} ({})\n", diagnosis.hint()));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verity_core::{Digest, Version};
    use verity_log::{ExecutionContext, RunRecorder, decode_ndjson, encode_ndjson};

    fn record(tags: Value, output: Value) -> (RunManifest, Vec<RecordedEvent>) {
        let ctx = ExecutionContext::new(Version::new(1, 0, 0), Digest::sha256(b"policy"))
            .with_inputs(&json!({"q": "x"}))
            .unwrap();
        let mut rec = RunRecorder::start(ctx).unwrap();
        rec.state("a", json!(1)).unwrap();
        rec.state("b", json!(2)).unwrap();
        rec.tool_call("c1", "search", json!({}), json!({"hits": 3})).unwrap();
        rec.state("tags", tags).unwrap();
        let run = rec.complete(output).unwrap();
        let events = decode_ndjson(&encode_ndjson(&run.events).unwrap()).unwrap();
        (run.manifest, events)
    }

    fn view<'a>(run: &'a (RunManifest, Vec<RecordedEvent>)) -> RunView<'a> {
        RunView {
            manifest: &run.0,
            events: &run.1,
        }
    }

    #[test]
    fn test_identical_runs() {
        let a = record(json!(["x", "y"]), json!({"ok": true}));
        let b = record(json!(["x", "y"]), json!({"ok": true}));
        let diff = diff_runs(view(&a), view(&b)).unwrap();
        assert!(diff.identical);
        assert!(diff.event_diff.is_none());
        assert!(diff.diagnosis.is_none());
    }

    #[test]
    fn test_array_permutation_at_event_five() {
        let a = record(json!(["x", "y", "z"]), json!({"ok": true}));
        let b = record(json!(["z", "x", "y"]), json!({"ok": true}));
        let diff = diff_runs(view(&a), view(&b)).unwrap();
        assert!(!diff.identical);
        let event_log = diff.fields.iter().find(|f| f.field == "event_log_hash").unwrap();
        assert!(!event_log.matches);
        let event_diff = diff.event_diff.unwrap();
        assert_eq!(event_diff.first_divergent_index, 5);
        assert_eq!(event_diff.paths, vec!["payload.value[0]", "payload.value[1]", "payload.value[2]"]);
        assert_eq!(diff.diagnosis, Some(Diagnosis::ArrayOrder));
    }

    #[test]
    fn test_event_count_mismatch() {
        let a = record(json!([]), json!(null));
        let mut b = record(json!([]), json!(null));
        b.1.pop();
        b.0.event_count -= 1;
        let diff = diff_runs(view(&a), view(&b)).unwrap();
        assert_eq!(diff.diagnosis, Some(Diagnosis::EventCountMismatch));
        let event_diff = diff.event_diff.unwrap();
        assert!(event_diff.event_b.is_none());
    }

    #[test]
    fn test_output_nondeterministic() {
        let a = record(json!([]), json!({"n": 1}));
        let mut b = a.clone();
        b.0.output_hash = Digest::sha256(b"other output");
        let diff = diff_runs(view(&a), view(&b)).unwrap();
        assert_eq!(diff.diagnosis, Some(Diagnosis::OutputNondeterministic));
    }

    #[test]
    fn test_map_iteration_from_raw_key_order() {
        let a = record(json!([]), json!(null));
        let mut b = a.clone();
        let original = b.1[1].event.clone();
        let reordered = r#"{"type":"state_transition","seq":1,"payload":{"value":1,"key":"a"}}"#;
        b.1[1] = RecordedEvent {
            event: original,
            raw: serde_json::value::RawValue::from_string(reordered.to_string()).unwrap(),
        };
        let diff = diff_runs(view(&a), view(&b)).unwrap();
        assert!(diff.identical);
        assert_eq!(diff.event_diff.unwrap().first_divergent_index, 1);
        assert_eq!(diff.diagnosis, Some(Diagnosis::MapIteration));
    }

    #[test]
    fn test_key_order_detection() {
        assert!(key_order_differs(r#"{"a":1,"b":2}"#, r#"{"b":2,"a":1}"#));
        assert!(!key_order_differs(r#"{"a":1,"b":2}"#, r#"{"a":1,"b":2}"#));
        assert!(!key_order_differs(r#"{"a":1}"#, r#"{"c":1}"#));
        assert!(key_order_differs(r#"{"x":[{"a":1,"b":2}]}"#, r#"{"x":[{"b":2,"a":1}]}"#));
    }

    #[test]
    fn test_diff_paths() {
        let a = json!({"a": 1, "b": {"c": [1, 2]}, "d": true});
        let b = json!({"a": 1, "b": {"c": [1, 3]}, "e": true});
        assert_eq!(diff_paths(&a, &b), vec!["b.c[1]", "d", "e"]);
        assert_eq!(diff_paths(&json!(1), &json!(2)), vec!["$"]);
        assert!(diff_paths(&a, &a).is_empty());
    }

    #[test]
    fn test_table_mentions_diagnosis() {
        let a = record(json!(["x", "y"]), json!(null));
        let b = record(json!(["y", "x"]), json!(null));
        let table = diff_runs(view(&a), view(&b)).unwrap().render_table();
        assert!(table.contains("first divergent event: 5"));
        assert!(table.contains("array-order"));
    }
}
