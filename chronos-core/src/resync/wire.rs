//! Wire format shared by both sides of the resync protocol.
//!
//! Pages are validated strictly: a malformed body is rejected whole, a
//! malformed entry is reported individually so the caller can count it and
//! keep the rest of the page. The callback block is opaque and preserved
//! exactly as received.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::store::ResyncEntry;
use crate::timer::{NodeAddr, Timer, TimerId};

const TIMERS: &str = "Timers";
const TIMER_ID: &str = "TimerID";
const OLD_REPLICAS: &str = "OldReplicas";
const TIMER: &str = "Timer";
const TIMING: &str = "timing";
const START_TIME_DELTA: &str = "start-time-delta";
const INTERVAL: &str = "interval";
const REPEAT_FOR: &str = "repeat-for";
const CALLBACK: &str = "callback";
const RELIABILITY: &str = "reliability";
const REPLICAS: &str = "replicas";

/// A page whose top-level structure is unusable.
#[derive(Debug, Error)]
pub enum PageError {
    /// The body is not JSON at all.
    #[error("page is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The top-level `"Timers"` array is missing or not an array.
    #[error("page has no top-level \"Timers\" array")]
    MissingTimers,
}

/// The inner timer object of a resync entry or replication body.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerFields {
    /// Next pop relative to the sender's clock; negative when overdue.
    pub start_time_delta_ms: i64,
    /// Pop interval.
    pub interval_ms: u32,
    /// Total pop window.
    pub repeat_for_ms: u32,
    /// Opaque callback block.
    pub callback: Value,
    /// Replica list computed for the new view; index 0 is the primary.
    pub replicas: Vec<NodeAddr>,
}

impl TimerFields {
    /// Materializes a timer, rebasing the pop time onto the receiver's
    /// clock. Pops already overdue are clamped to fire immediately.
    #[must_use]
    pub fn into_timer(self, id: TimerId, now_ms: u64, view_id: String) -> Timer {
        let next_pop_ms = (now_ms as i64).saturating_add(self.start_time_delta_ms).max(0) as u64;
        Timer {
            id,
            next_pop_ms,
            interval_ms: self.interval_ms,
            repeat_for_ms: self.repeat_for_ms,
            sequence_number: 0,
            callback: self.callback,
            replicas: self.replicas,
            view_id,
        }
    }
}

/// One fully-validated entry of a resync page.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncRecord {
    /// Timer identifier.
    pub id: TimerId,
    /// Who held the timer under the prior view.
    pub old_replicas: Vec<NodeAddr>,
    /// The timer itself, carrying the new replica list.
    pub fields: TimerFields,
}

/// Per-entry parse result. Invalid entries carry the reason so callers can
/// log and count them without failing the page.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    /// Entry passed validation.
    Valid(ResyncRecord),
    /// Entry was discarded.
    Invalid(String),
}

/// Parses the body of a resync `GET /timers` response.
pub fn parse_page(body: &str) -> Result<Vec<EntryOutcome>, PageError> {
    let value: Value = serde_json::from_str(body)?;
    let timers = value
        .get(TIMERS)
        .and_then(Value::as_array)
        .ok_or(PageError::MissingTimers)?;
    Ok(timers.iter().map(parse_entry).collect())
}

fn parse_entry(entry: &Value) -> EntryOutcome {
    match try_parse_entry(entry) {
        Ok(record) => EntryOutcome::Valid(record),
        Err(reason) => EntryOutcome::Invalid(reason),
    }
}

fn try_parse_entry(entry: &Value) -> Result<ResyncRecord, String> {
    if !entry.is_object() {
        return Err("entry is not an object".to_string());
    }
    let id = entry
        .get(TIMER_ID)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing integer {TIMER_ID:?}"))?;
    let old_replicas = parse_node_array(entry.get(OLD_REPLICAS), OLD_REPLICAS)?;
    let timer = entry
        .get(TIMER)
        .filter(|t| t.is_object())
        .ok_or_else(|| format!("missing {TIMER:?} object"))?;
    let fields = parse_timer_fields(timer)?;
    Ok(ResyncRecord {
        id: TimerId(id),
        old_replicas,
        fields,
    })
}

/// Validates the inner timer object (`timing`/`callback`/`reliability`).
pub fn parse_timer_fields(timer: &Value) -> Result<TimerFields, String> {
    let timing = timer
        .get(TIMING)
        .filter(|t| t.is_object())
        .ok_or_else(|| format!("missing {TIMING:?} object"))?;
    let start_time_delta_ms = match timing.get(START_TIME_DELTA) {
        None => 0,
        Some(delta) => delta
            .as_i64()
            .ok_or_else(|| format!("{START_TIME_DELTA:?} is not an integer"))?,
    };
    let interval_ms = parse_u32(timing, INTERVAL)?;
    let repeat_for_ms = parse_u32(timing, REPEAT_FOR)?;
    let callback = timer
        .get(CALLBACK)
        .filter(|c| c.is_object())
        .ok_or_else(|| format!("missing {CALLBACK:?} object"))?
        .clone();
    let reliability = timer
        .get(RELIABILITY)
        .filter(|r| r.is_object())
        .ok_or_else(|| format!("missing {RELIABILITY:?} object"))?;
    let replicas = parse_node_array(reliability.get(REPLICAS), REPLICAS)?;
    if replicas.is_empty() {
        return Err(format!("{REPLICAS:?} must not be empty"));
    }
    Ok(TimerFields {
        start_time_delta_ms,
        interval_ms,
        repeat_for_ms,
        callback,
        replicas,
    })
}

fn parse_u32(timing: &Value, field: &str) -> Result<u32, String> {
    timing
        .get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| format!("{field:?} is not a u32"))
}

fn parse_node_array(value: Option<&Value>, field: &str) -> Result<Vec<NodeAddr>, String> {
    let array = value
        .and_then(Value::as_array)
        .ok_or_else(|| format!("missing {field:?} array"))?;
    array
        .iter()
        .map(|node| {
            node.as_str()
                .map(NodeAddr::new)
                .ok_or_else(|| format!("{field:?} contains a non-string"))
        })
        .collect()
}

/// Serializes the inner timer object, with the pop time as a delta from
/// `now_ms`.
#[must_use]
pub fn timer_json(timer: &Timer, now_ms: u64) -> Value {
    json!({
        TIMING: {
            START_TIME_DELTA: timer.next_pop_ms as i64 - now_ms as i64,
            INTERVAL: timer.interval_ms,
            REPEAT_FOR: timer.repeat_for_ms,
        },
        CALLBACK: timer.callback,
        RELIABILITY: {
            REPLICAS: timer.replicas,
        },
    })
}

/// Serializes a full resync page body.
#[must_use]
pub fn page_json(entries: &[ResyncEntry], now_ms: u64) -> Value {
    let timers: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                TIMER_ID: entry.timer.id,
                OLD_REPLICAS: entry.old_replicas,
                TIMER: timer_json(&entry.timer, now_ms),
            })
        })
        .collect();
    json!({ TIMERS: timers })
}

/// One `(timer, replica-index)` reference named in a drop-reference batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerReference {
    /// Timer identifier.
    #[serde(rename = "ID")]
    pub id: TimerId,
    /// The sender's index in the timer's new replica list.
    #[serde(rename = "ReplicaIndex")]
    pub replica_index: u32,
}

/// Body of `DELETE /timers/references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReferenceBatch {
    /// References being dropped.
    #[serde(rename = "IDs")]
    pub ids: Vec<TimerReference>,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn valid_entry() -> &'static str {
        r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999", "10.0.0.3:9999"], "Timer": {"timing": { "interval": 100, "repeat-for": 200 }, "callback": { "http": { "uri": "localhost", "opaque": "stuff" }}, "reliability": { "replicas": [ "10.0.0.1:9999", "10.0.0.3:9999" ] }}}]}"#
    }

    #[test]
    fn parses_a_valid_page() {
        let outcomes = parse_page(valid_entry()).unwrap();
        assert_eq!(outcomes.len(), 1);
        let EntryOutcome::Valid(record) = &outcomes[0] else {
            panic!("expected a valid entry: {outcomes:?}");
        };
        assert_eq!(record.id, TimerId(4));
        assert_eq!(
            record.old_replicas,
            vec![NodeAddr::new("10.0.0.2:9999"), NodeAddr::new("10.0.0.3:9999")]
        );
        assert_eq!(record.fields.start_time_delta_ms, 0);
        assert_eq!(record.fields.interval_ms, 100);
        assert_eq!(record.fields.repeat_for_ms, 200);
        assert_eq!(
            record.fields.replicas,
            vec![NodeAddr::new("10.0.0.1:9999"), NodeAddr::new("10.0.0.3:9999")]
        );
    }

    #[test]
    fn empty_page_parses_to_nothing() {
        assert!(parse_page(r#"{"Timers":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn malformed_bodies_are_rejected_whole() {
        assert!(matches!(
            parse_page(r#"{"Timers":}"#),
            Err(PageError::Json(_))
        ));
        assert!(matches!(
            parse_page(r#"{"Timers":]}"#),
            Err(PageError::Json(_))
        ));
        assert!(matches!(
            parse_page(r#"{"Timer":[]}"#),
            Err(PageError::MissingTimers)
        ));
        assert!(matches!(
            parse_page(r#"{"Timers":{}}"#),
            Err(PageError::MissingTimers)
        ));
    }

    #[test]
    fn malformed_entries_are_reported_individually() {
        let cases = [
            r#"{"Timers":["Timer"]}"#,
            r#"{"Timers":[{"TimerID":4}]}"#,
            r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999"]}]}"#,
            r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999"], "Timer": {}}]}"#,
            r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999"], "Timer": {"timing": { "interval": 100, "repeat-for": 200 }, "callback": { "http": {} }, "reliability": {}}}]}"#,
            r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999"], "Timer": {"timing": { "interval": 100, "repeat-for": 200 }, "callback": { "http": {} }, "reliability": { "replicas": [] }}}]}"#,
            r#"{"Timers":[{"TimerID":"four", "OldReplicas":[], "Timer": {}}]}"#,
        ];
        for body in cases {
            let outcomes = parse_page(body).unwrap();
            assert_eq!(outcomes.len(), 1, "body: {body}");
            assert!(
                matches!(&outcomes[0], EntryOutcome::Invalid(_)),
                "body: {body}"
            );
        }
    }

    #[test]
    fn a_bad_entry_does_not_poison_its_neighbours() {
        let body = r#"{"Timers":[{"TimerID":4, "OldReplicas":["10.0.0.2:9999"], "Timer": {}}, {"TimerID":5, "OldReplicas":["10.0.0.2:9999"], "Timer": {"timing": { "interval": 100, "repeat-for": 200 }, "callback": { "http": {} }, "reliability": { "replicas": ["10.0.0.1:9999"] }}}]}"#;
        let outcomes = parse_page(body).unwrap();
        assert!(matches!(&outcomes[0], EntryOutcome::Invalid(_)));
        let EntryOutcome::Valid(record) = &outcomes[1] else {
            panic!("second entry should parse");
        };
        assert_eq!(record.id, TimerId(5));
    }

    #[test]
    fn negative_delta_rebases_to_an_overdue_pop() {
        let body = r#"{"Timers":[{"TimerID":4, "OldReplicas":[], "Timer": {"timing": { "start-time-delta": -235, "interval": 100, "repeat-for": 200 }, "callback": { "http": {} }, "reliability": { "replicas": ["10.0.0.1:9999"] }}}]}"#;
        let outcomes = parse_page(body).unwrap();
        let EntryOutcome::Valid(record) = outcomes.into_iter().next().unwrap() else {
            panic!("entry should parse");
        };
        assert_eq!(record.fields.start_time_delta_ms, -235);
        let timer = record
            .fields
            .into_timer(TimerId(4), 100_000, "view".to_string());
        assert_eq!(timer.next_pop_ms, 99_765);
    }

    #[test]
    fn serialized_pages_reparse_to_the_same_timers() {
        let timer = Timer {
            id: TimerId(9),
            next_pop_ms: 10_750,
            interval_ms: 250,
            repeat_for_ms: 1_000,
            sequence_number: 2,
            callback: serde_json::json!({"http": {"uri": "localhost", "opaque": "stuff"}}),
            replicas: vec![NodeAddr::new("10.0.0.1:9999"), NodeAddr::new("10.0.0.2:9999")],
            view_id: "view-2".to_string(),
        };
        let entry = ResyncEntry {
            old_replicas: vec![NodeAddr::new("10.0.0.3:9999")],
            timer: timer.clone(),
        };
        let body = page_json(&[entry], 10_000).to_string();
        let outcomes = parse_page(&body).unwrap();
        let EntryOutcome::Valid(record) = outcomes.into_iter().next().unwrap() else {
            panic!("rendered page should parse");
        };
        assert_eq!(record.id, timer.id);
        assert_eq!(record.old_replicas, vec![NodeAddr::new("10.0.0.3:9999")]);
        assert_eq!(record.fields.start_time_delta_ms, 750);
        assert_eq!(record.fields.interval_ms, timer.interval_ms);
        assert_eq!(record.fields.repeat_for_ms, timer.repeat_for_ms);
        assert_eq!(record.fields.replicas, timer.replicas);
        assert_eq!(record.fields.callback, timer.callback);
    }

    #[test]
    fn reference_batches_serialize_in_the_agreed_shape() {
        let batch = ReferenceBatch {
            ids: vec![TimerReference {
                id: TimerId(4),
                replica_index: 0,
            }],
        };
        let body = serde_json::to_string(&batch).unwrap();
        assert_eq!(body, r#"{"IDs":[{"ID":4,"ReplicaIndex":0}]}"#);
        let parsed: ReferenceBatch = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed, batch);
    }
}
