//! Label-leak filtering.
//!
//! Run bundles from instrumented test devices can carry ground-truth labels
//! (scenario tags, injected-fault names, `obs_*` observer fields). None of
//! that may reach the model: the diagnosis has to be earned from raw
//! evidence. These helpers strip labels from metadata, events, and log
//! excerpts before anything is serialized into a prompt.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::types::RunMeta;

/// Metadata keys that carry labels outright.
const DROP_KEYS: &[&str] = &[
    "scenario_tag",
    "fault_type",
    "family",
    "severity",
    "gt_family",
    "gt_severity",
    "gt_fault",
    "gt_label",
    "labels",
    "scenario",
    "obs_primary",
    "obs_fault",
];

#[allow(clippy::expect_used)]
fn scenario_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(cpu|mem|bg|net|background)_[A-Za-z0-9_]+\b").expect("static pattern")
    })
}

#[allow(clippy::expect_used)]
fn obs_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bobs_[A-Za-z0-9_]+\b").expect("static pattern"))
}

/// Metadata projection safe to show the model. Drops `obs_*` keys and the
/// known label keys, keeps everything else verbatim.
pub fn sanitize_meta(meta: &RunMeta) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in meta.iter() {
        let k = key.trim();
        if k.starts_with("obs_") || DROP_KEYS.contains(&k) {
            continue;
        }
        out.insert(k.to_string(), value.clone());
    }
    out
}

/// True when an event record leaks a label through a key or string value.
pub fn event_has_label_leak(event: &Map<String, Value>) -> bool {
    for (key, value) in event {
        if key.contains("obs_") || key == "scenario_tag" || key == "fault_type" {
            return true;
        }
        if let Value::String(s) = value {
            if s.contains("obs_") || s.contains("scenario_tag") || s.contains("fault_type") {
                return true;
            }
        }
    }
    false
}

/// Scrub an event `msg`. Marker lines (poke / run_begin / run_end) embed the
/// scenario name, sometimes twice, so those get scenario-token and `obs_*`
/// redaction plus a conservative cut of long colon-joined tails.
pub fn sanitize_event_msg(msg: &str) -> String {
    let mut s = msg.to_string();
    if s.contains("poke") || s.contains("run_end") || s.contains("run_begin") {
        s = scenario_token_re()
            .replace_all(&s, "<redacted_scenario>")
            .into_owned();
        s = obs_token_re().replace_all(&s, "<redacted_obs>").into_owned();

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() >= 6 {
            let mut kept: Vec<String> = parts[..4].iter().map(|p| p.to_string()).collect();
            kept.extend(std::iter::repeat("<redacted>".to_string()).take(parts.len() - 4));
            s = kept.join(":");
        }
    }
    s
}

/// General-purpose redaction for free text (log excerpts, prompt lines).
pub fn redact_label_leaks(text: &str) -> String {
    let s = obs_token_re().replace_all(text, "<redacted_obs>");
    s.replace("scenario_tag", "<redacted_meta>")
        .replace("fault_type", "<redacted_meta>")
}
