//! Device event stream loading.
//!
//! Events arrive as JSONL (`events/events_*.jsonl`). Records that leak
//! labels are dropped entirely; marker messages get their scenario tokens
//! redacted. Malformed lines are skipped, never fatal.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Map, Value};

use super::redact::{event_has_label_leak, sanitize_event_msg};
use crate::types::value_as_int;

/// One sanitized event record (arbitrary shape, kept as a JSON map).
pub type Event = Map<String, Value>;

/// Load, sanitize, and window-filter the event stream.
///
/// The window applies only when both bounds are valid; events without a
/// parsable `ts` survive the filter.
pub fn load_events(path: &Path, start_ms: Option<i64>, end_ms: Option<i64>) -> Vec<Event> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let window = match (start_ms, end_ms) {
        (Some(s), Some(e)) if s > 0 && e > 0 => Some((s, e)),
        _ => None,
    };

    let mut events = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(Value::Object(mut obj)) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if event_has_label_leak(&obj) {
            continue;
        }
        if let Some(msg) = obj.get("msg").and_then(Value::as_str) {
            let clean = sanitize_event_msg(msg);
            obj.insert("msg".to_string(), Value::String(clean));
        }
        if let Some((start, end)) = window {
            if let Some(ts) = obj.get("ts").and_then(value_as_int) {
                if ts < start || ts > end {
                    continue;
                }
            }
        }
        events.push(obj);
    }
    events
}

/// Count events per `tag` (absent tag counts as "unknown"). Ordered map so
/// the prompt rendering is deterministic.
pub fn tag_counts(events: &[Event]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for event in events {
        let tag = event
            .get("tag")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .unwrap_or("unknown");
        *counts.entry(tag.to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_events(body: &str) -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events_0.jsonl");
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn leaky_records_are_dropped_and_msgs_sanitized() {
        let (_dir, path) = write_events(concat!(
            "{\"ts\": 100, \"tag\": \"cpu_hotspot\", \"msg\": \"load spike\"}\n",
            "{\"ts\": 110, \"obs_cpu\": 1, \"msg\": \"observer\"}\n",
            "{\"ts\": 120, \"tag\": \"marker\", \"msg\": \"poke a:b:c:d:e:cpu_busy_loop\"}\n",
            "not json\n",
        ));
        let events = load_events(&path, None, None);
        assert_eq!(events.len(), 2);
        let msg = events[1].get("msg").unwrap().as_str().unwrap();
        assert!(!msg.contains("cpu_busy_loop"));
    }

    #[test]
    fn window_applies_only_with_valid_bounds() {
        let (_dir, path) = write_events(concat!(
            "{\"ts\": 100, \"tag\": \"a\"}\n",
            "{\"ts\": 900, \"tag\": \"b\"}\n",
            "{\"tag\": \"no_ts\"}\n",
        ));
        let events = load_events(&path, Some(50), Some(500));
        let tags: Vec<&str> = events
            .iter()
            .filter_map(|e| e.get("tag").and_then(Value::as_str))
            .collect();
        assert_eq!(tags, vec!["a", "no_ts"]);

        assert_eq!(load_events(&path, Some(0), Some(500)).len(), 3);
    }

    #[test]
    fn tag_counting() {
        let (_dir, path) = write_events(concat!(
            "{\"ts\": 1, \"tag\": \"mem_pressure\"}\n",
            "{\"ts\": 2, \"tag\": \"mem_pressure\"}\n",
            "{\"ts\": 3}\n",
        ));
        let events = load_events(&path, None, None);
        let counts = tag_counts(&events);
        assert_eq!(counts.get("mem_pressure"), Some(&2));
        assert_eq!(counts.get("unknown"), Some(&1));
    }
}
