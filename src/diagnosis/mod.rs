//! Diagnosis Synthesizer
//!
//! Converts free-text model summaries into the structured verdict the rest
//! of the system consumes, and degrades to a deterministic collection
//! script when inference is unavailable. The parser is forgiving: models
//! drift in formatting, so numbered sections are located by prefix and the
//! classification falls back to keyword scanning over the whole reply.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::evidence::RunEvidence;
use crate::types::{
    Action, ActionSet, CandidateProcess, Diagnosis, DiagnosisError, EvidenceItem, FaultFamily,
    FaultState, Notes, SuspectProcess, SuspectRole, GAP_EVIDENCE_INSUFFICIENT,
    GAP_PIDSTAT_INTERVAL_MISSING, GAP_PIDSTAT_MISSING, SCHEMA_VERSION,
};

pub const WHY_FALLBACK_COLLECT: &str = "fallback_collect";
pub const WHY_STAGE2_COLLECT: &str = "stage2_collect";

const SUSPECT_LIMIT: usize = 5;
const NEXT_CHECKS_DEFAULT: usize = 4;

// ============================================================================
// Summary parsing
// ============================================================================

#[allow(clippy::expect_used)]
fn section_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([1-4])[.、)]").expect("static pattern"))
}

#[allow(clippy::expect_used)]
fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(confidence|conf)\s*[:=]\s*([01](?:\.\d+)?)").expect("static pattern")
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Judge,
    Root,
    Actions,
    Confidence,
}

/// Split a `key: value` line on ASCII or fullwidth colon.
fn split_kv(line: &str) -> Option<(&str, &str)> {
    for sep in [":", "："] {
        if let Some((k, v)) = line.split_once(sep) {
            return Some((k.trim(), v.trim()));
        }
    }
    None
}

/// Parse a model summary into a diagnosis + notes pair.
///
/// The expected shape is the four numbered sections the prompt asks for
/// (verdict, evidence bullets, suggested checks, confidence), but every
/// part is optional and keyword fallbacks fill the gaps.
pub fn parse_summary(summary: &str, fallback_severity: &str) -> (Diagnosis, Notes) {
    let mut fault_state = FaultState::Unknown;
    let mut family = FaultFamily::Other;
    let mut confidence: f64 = 0.0;
    let mut root_lines: Vec<String> = Vec::new();
    let mut action_lines: Vec<String> = Vec::new();

    let mut section = Section::None;
    for raw in summary.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(cap) = section_re().captures(line) {
            section = match &cap[1] {
                "1" => Section::Judge,
                "2" => Section::Root,
                "3" => Section::Actions,
                _ => Section::Confidence,
            };
            if section == Section::Confidence {
                if let Some(cap) = confidence_re().captures(line) {
                    if let Ok(v) = cap[2].parse() {
                        confidence = v;
                    }
                }
            }
            // a heading may carry its value inline ("1. fault_state: fault"),
            // so it still goes through the key-value scan below
        }

        let lower = line.to_ascii_lowercase();
        if lower.contains("fault_state") || lower.contains("fault state") || lower.contains("state")
        {
            if let Some((_, value)) = split_kv(line) {
                let v = value.to_ascii_lowercase();
                if v.contains("fault") || v.contains("abnormal") || v.contains("anomaly") {
                    fault_state = FaultState::Fault;
                } else if v.contains("normal") {
                    fault_state = FaultState::Normal;
                }
            }
        }
        if lower.contains("family") {
            if let Some((_, value)) = split_kv(line) {
                if let Some(token) = value.split_whitespace().next() {
                    family = FaultFamily::parse_token(token);
                }
            }
        }
        if lower.contains("confidence") {
            if let Some((_, value)) = split_kv(line) {
                if let Ok(v) = value.parse() {
                    confidence = v;
                }
            }
        }

        if let Some(bullet) = line.strip_prefix('-') {
            match section {
                Section::Root => root_lines.push(bullet.trim().to_string()),
                Section::Actions => action_lines.push(bullet.trim().to_string()),
                _ => {}
            }
        }
    }

    // keyword fallback over the whole reply
    let summary_lower = summary.to_ascii_lowercase();
    if fault_state == FaultState::Unknown {
        if summary_lower.contains("fault")
            || summary_lower.contains("abnormal")
            || summary_lower.contains("anomaly")
        {
            fault_state = FaultState::Fault;
        } else if summary_lower.contains("normal") {
            fault_state = FaultState::Normal;
        }
    }
    if family == FaultFamily::Other {
        family = if summary_lower.contains("cpu") {
            FaultFamily::Cpu
        } else if summary_lower.contains("mem") || summary_lower.contains("memory") {
            FaultFamily::Mem
        } else if summary_lower.contains("background") || summary_lower.contains("bg") {
            FaultFamily::Background
        } else if summary_lower.contains("net") || summary_lower.contains("network") {
            FaultFamily::Net
        } else if summary_lower.contains("io") {
            FaultFamily::Io
        } else {
            FaultFamily::Other
        };
    }

    let severity = if fallback_severity.is_empty() {
        "unknown".to_string()
    } else {
        fallback_severity.to_string()
    };
    let diagnosis = Diagnosis {
        fault_state,
        family,
        severity,
        root_cause: root_lines.join(" ").trim().to_string(),
        evidence: root_lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| EvidenceItem::new(l.clone(), "llm_summary"))
            .collect(),
        evidence_text: root_lines,
        confidence,
        ..Diagnosis::default()
    };
    let notes = Notes {
        schema_version: SCHEMA_VERSION,
        actions_manual: action_lines,
        summary: summary.trim().to_string(),
    };
    (diagnosis, notes)
}

// ============================================================================
// Fallback catalog
// ============================================================================

const COLLECT_CMDS: &[&str] = &[
    "dmesg | tail -n 200",
    "cat /proc/loadavg",
    "cat /proc/meminfo | head -n 40",
    "ps -A | head -n 80",
    "top -n 1 | head -n 80",
];

/// The fixed low-risk collection script: gather more evidence, touch
/// nothing.
pub fn collect_actions() -> ActionSet {
    ActionSet {
        schema_version: SCHEMA_VERSION,
        actions: COLLECT_CMDS
            .iter()
            .map(|cmd| Action {
                kind: "collect".to_string(),
                target: "device".to_string(),
                cmd: (*cmd).to_string(),
                timeout_sec: 20,
                risk: "low".to_string(),
                why: WHY_FALLBACK_COLLECT.to_string(),
            })
            .collect(),
    }
}

/// Deterministic verdict for a failed inference: unknown state, the reason
/// as a risk flag, and the collection script.
pub fn fallback_result(reason_flag: &str) -> (Diagnosis, ActionSet) {
    (Diagnosis::unresolved(reason_flag), collect_actions())
}

/// Attach structured failure detail to a diagnosis.
pub fn mark_error(diag: &mut Diagnosis, kind: &str, message: &str) {
    let hint = if kind == "oom" {
        "accelerator OOM: lower the memory footprint or set low_vram_policy=wait/skip"
    } else {
        "check infer_error.txt for details"
    };
    diag.ok = Some(false);
    diag.error = Some(DiagnosisError {
        kind: kind.to_string(),
        message: message.to_string(),
        hint: hint.to_string(),
    });
    if diag.summary.is_none() {
        diag.summary = Some(format!("{kind}: {message}"));
    }
}

// ============================================================================
// Suspects & narrative
// ============================================================================

/// Ranked suspect list with explicit evidence-gap accounting. Primary and
/// secondary roles first, remaining candidates fill up to the limit.
pub fn build_suspects_list(
    candidates: &[CandidateProcess],
    primary: Option<&CandidateProcess>,
    secondary: &[CandidateProcess],
) -> Vec<SuspectProcess> {
    let mut out: Vec<SuspectProcess> = Vec::new();
    let mut seen: Vec<i64> = Vec::new();

    let mut add = |item: &CandidateProcess, role: SuspectRole, out: &mut Vec<SuspectProcess>| {
        if seen.contains(&item.pid) {
            return;
        }
        seen.push(item.pid);
        let mut evidence_missing = Vec::new();
        if item.cpu_delta_jiffies.is_none() {
            evidence_missing.push(GAP_PIDSTAT_MISSING.to_string());
        } else if item.cpu_pct.is_none() {
            evidence_missing.push(GAP_PIDSTAT_INTERVAL_MISSING.to_string());
        }
        out.push(SuspectProcess {
            pid: item.pid,
            name: item.name.clone(),
            role,
            cpu_pct: item.cpu_pct,
            rss_kb: item.rss_kb,
            score: item.score,
            evidence_ok: evidence_missing.is_empty(),
            evidence_missing,
        });
    };

    if let Some(p) = primary {
        add(p, SuspectRole::Primary, &mut out);
    }
    for s in secondary {
        add(s, SuspectRole::Secondary, &mut out);
    }
    for c in candidates {
        if out.len() >= SUSPECT_LIMIT {
            break;
        }
        add(c, SuspectRole::Candidate, &mut out);
    }
    out.truncate(SUSPECT_LIMIT);
    out
}

/// Suggested follow-up commands, lifted from the action script.
pub fn next_checks(actions: &ActionSet, limit: usize) -> Vec<String> {
    let mut out: Vec<String> = actions
        .actions
        .iter()
        .map(|a| a.cmd.trim().to_string())
        .filter(|c| !c.is_empty())
        .take(limit)
        .collect();
    if out.is_empty() {
        out.push("collect pidstat/procs process-level evidence".to_string());
    }
    out
}

/// Human-readable Observation / Hypothesis / Evidence / NextChecks digest.
pub fn build_narrative(
    observations: &[String],
    hypothesis: &str,
    evidence: &[EvidenceItem],
    checks: &[String],
) -> String {
    let mut evs: Vec<EvidenceItem> = evidence.iter().filter(|e| !e.text.is_empty()).cloned().collect();
    if evs.len() < 2 {
        evs.push(
            EvidenceItem::new(
                "evidence chain incomplete: some metrics/logs missing, conclusion uncertain",
                "system",
            )
            .with_gap(GAP_EVIDENCE_INSUFFICIENT),
        );
    }
    evs.truncate(5);

    let mut lines: Vec<String> = Vec::new();
    lines.push("Observation:".to_string());
    if observations.is_empty() {
        lines.push("- (no usable observation summary)".to_string());
    } else {
        for o in observations {
            lines.push(format!("- {o}"));
        }
    }

    lines.push("Hypothesis:".to_string());
    if hypothesis.is_empty() {
        lines.push("- (insufficient evidence for a root-cause hypothesis)".to_string());
    } else {
        lines.push(format!("- {hypothesis}"));
    }

    lines.push("Evidence:".to_string());
    for e in &evs {
        let gap_text = if e.gaps.is_empty() {
            String::new()
        } else {
            format!("; gaps={}", e.gaps.join(","))
        };
        lines.push(format!("- {}{} (source={})", e.text, gap_text, e.source));
    }

    lines.push("NextChecks:".to_string());
    if checks.is_empty() {
        lines.push("- (no suggested actions)".to_string());
    } else {
        for c in checks {
            lines.push(format!("- {c}"));
        }
    }
    lines.join("\n")
}

/// Final enrichment applied to every emitted diagnosis, success or
/// fallback: severity invariant, process candidates, suspects, evidence
/// gap accounting, narrative, and timing facts.
pub fn enrich(diag: &mut Diagnosis, ev: &RunEvidence, actions: &ActionSet) {
    diag.enforce_severity_invariant();

    diag.candidate_processes = ev.candidates.clone();
    diag.primary_suspect = ev.primary_suspect.clone();
    diag.secondary_suspects = ev.secondary_suspects.clone();
    let suspects = build_suspects_list(
        &ev.candidates,
        ev.primary_suspect.as_ref(),
        &ev.secondary_suspects,
    );

    let missing_pids: Vec<String> = suspects
        .iter()
        .filter(|s| !s.evidence_ok)
        .map(|s| s.pid.to_string())
        .collect();
    if !missing_pids.is_empty() {
        let msg = format!(
            "pidstat did not cover these pids, unable to score: {}",
            missing_pids.join(",")
        );
        if !diag.evidence.iter().any(|e| e.text == msg) {
            diag.evidence
                .push(EvidenceItem::new(msg, "pidstat").with_gap(GAP_PIDSTAT_MISSING));
        }
    }
    if diag.evidence_text.is_empty() {
        diag.evidence_text = diag.evidence.iter().map(|e| e.text.clone()).collect();
    }

    diag.observations = ev.observations.clone();
    if diag.hypothesis.is_empty() {
        diag.hypothesis = if !diag.root_cause.is_empty() {
            diag.root_cause.clone()
        } else if let Some(summary) = diag.summary.as_ref().filter(|s| !s.is_empty()) {
            summary.clone()
        } else {
            "insufficient evidence for a definite root cause".to_string()
        };
    }
    diag.suspects = suspects;

    let checks = next_checks(actions, NEXT_CHECKS_DEFAULT);
    diag.narrative = build_narrative(&ev.observations, &diag.hypothesis, &diag.evidence, &checks);
    diag.clk_tck = Some(ev.clk_tck);
    diag.pidstat_interval_ms = ev.pidstat_interval_ms;
}

// ============================================================================
// Compact projection
// ============================================================================

fn truncate(text: &str, max_len: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_len).collect();
        format!("{cut}...")
    }
}

fn compact_suspect(s: &SuspectProcess) -> Value {
    let mut out = Map::new();
    if let Some(name) = s.name.as_deref().filter(|n| !n.is_empty()) {
        out.insert("name".to_string(), json!(truncate(name, 60)));
    }
    out.insert("pid".to_string(), json!(s.pid));
    out.insert("role".to_string(), json!(s.role));
    if let Some(pct) = s.cpu_pct {
        out.insert("cpu_pct".to_string(), json!(pct));
    }
    if let Some(rss) = s.rss_kb {
        out.insert("rss_kb".to_string(), json!(rss));
    }
    if let Some(score) = s.score {
        out.insert("score".to_string(), json!(score));
    }
    out.insert("evidence_ok".to_string(), json!(s.evidence_ok));
    if !s.evidence_missing.is_empty() {
        let gaps: Vec<String> = s
            .evidence_missing
            .iter()
            .take(3)
            .map(|g| truncate(g, 40))
            .collect();
        out.insert("evidence_missing".to_string(), json!(gaps));
    }
    Value::Object(out)
}

/// Size-bounded projection of a full diagnosis, published as the primary
/// `diagnosis.json` so downstream consumers never choke on an unbounded
/// model ramble.
pub fn compact_diagnosis(diag: &Diagnosis, actions: &ActionSet) -> Value {
    let mut out = Map::new();
    out.insert("schema_version".to_string(), json!(SCHEMA_VERSION));
    out.insert("fault_state".to_string(), json!(diag.fault_state));
    out.insert("family".to_string(), json!(diag.family));
    out.insert("severity".to_string(), json!(diag.severity));
    out.insert("confidence".to_string(), json!(diag.confidence));

    if let Some(ok) = diag.ok {
        out.insert("ok".to_string(), json!(ok));
    }
    if let Some(err) = &diag.error {
        out.insert(
            "error".to_string(),
            json!({
                "type": truncate(&err.kind, 60),
                "message": truncate(&err.message, 200),
                "hint": truncate(&err.hint, 200),
            }),
        );
    }

    let root_cause = if !diag.root_cause.is_empty() {
        diag.root_cause.clone()
    } else if !diag.hypothesis.is_empty() {
        diag.hypothesis.clone()
    } else {
        diag.summary.clone().unwrap_or_default()
    };
    out.insert("root_cause".to_string(), json!(truncate(&root_cause, 500)));

    if let Some(summary) = diag.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        out.insert("summary".to_string(), json!(truncate(summary, 500)));
    }
    if !diag.hypothesis.is_empty() {
        out.insert("hypothesis".to_string(), json!(truncate(&diag.hypothesis, 500)));
    }

    let evidence: Vec<Value> = diag
        .evidence
        .iter()
        .take(8)
        .filter(|e| !e.text.trim().is_empty())
        .map(|e| {
            let mut item = Map::new();
            item.insert("text".to_string(), json!(truncate(&e.text, 200)));
            if !e.source.is_empty() {
                item.insert("source".to_string(), json!(truncate(&e.source, 60)));
            }
            if !e.gaps.is_empty() {
                let gaps: Vec<String> = e.gaps.iter().take(3).map(|g| truncate(g, 40)).collect();
                item.insert("gaps".to_string(), json!(gaps));
            }
            Value::Object(item)
        })
        .collect();
    if !evidence.is_empty() {
        out.insert("evidence".to_string(), json!(evidence));
    }

    let checks: Vec<String> = next_checks(actions, 8)
        .iter()
        .map(|c| truncate(c, 200))
        .collect();
    if !checks.is_empty() {
        out.insert("next_checks".to_string(), json!(checks));
    }

    if !diag.suspects.is_empty() {
        let top: Vec<Value> = diag.suspects.iter().take(5).map(compact_suspect).collect();
        out.insert("top_suspects".to_string(), json!(top));
    }

    if !diag.risk_flags.is_empty() {
        let flags: Vec<String> = diag
            .risk_flags
            .iter()
            .take(8)
            .map(|f| truncate(f, 60))
            .collect();
        out.insert("risk_flags".to_string(), json!(flags));
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FLAG_INFERENCE_FAILED;

    const SAMPLE_SUMMARY: &str = "\
1. fault_state: fault
family: cpu
2. Root cause evidence:
- load1_x100 peaked at 820 during the window
- busyproc (pid=42) consumed 150 jiffies
3. Suggested checks:
- top -n 1 | head -n 80
4. Confidence: 0.8
";

    #[test]
    fn parses_numbered_summary() {
        let (diag, notes) = parse_summary(SAMPLE_SUMMARY, "high");
        assert_eq!(diag.fault_state, FaultState::Fault);
        assert_eq!(diag.family, FaultFamily::Cpu);
        assert_eq!(diag.severity, "high");
        assert!((diag.confidence - 0.8).abs() < 1e-9);
        assert_eq!(diag.evidence.len(), 2);
        assert_eq!(diag.evidence[0].source, "llm_summary");
        assert!(diag.root_cause.contains("820"));
        assert_eq!(notes.actions_manual, vec!["top -n 1 | head -n 80"]);
    }

    #[test]
    fn keyword_fallback_when_unstructured() {
        let (diag, _) = parse_summary("everything looks normal, memory is fine", "");
        assert_eq!(diag.fault_state, FaultState::Normal);
        assert_eq!(diag.family, FaultFamily::Mem);
        assert_eq!(diag.severity, "unknown");
    }

    #[test]
    fn confidence_from_section_header() {
        let (diag, _) = parse_summary("4) confidence=0.65", "");
        assert!((diag.confidence - 0.65).abs() < 1e-9);
    }

    #[test]
    fn fallback_result_is_deterministic() {
        let (diag, actions) = fallback_result(FLAG_INFERENCE_FAILED);
        assert_eq!(diag.fault_state, FaultState::Unknown);
        assert_eq!(diag.risk_flags, vec![FLAG_INFERENCE_FAILED]);
        assert_eq!(actions.actions.len(), 5);
        assert!(actions.actions.iter().all(|a| a.risk == "low"));
        assert!(actions.actions.iter().all(|a| a.why == WHY_FALLBACK_COLLECT));
        assert_eq!(actions.actions[0].cmd, "dmesg | tail -n 200");
    }

    fn candidate(pid: i64, delta: Option<i64>, pct: Option<f64>) -> CandidateProcess {
        CandidateProcess {
            pid,
            name: Some(format!("p{pid}")),
            stat: Some("R".to_string()),
            rss_kb: Some(100),
            cpu_delta_jiffies: delta,
            cpu_pct: pct,
            score: delta,
            signals: Vec::new(),
            source: "procs".to_string(),
        }
    }

    #[test]
    fn suspects_carry_roles_and_gaps() {
        let cands = vec![
            candidate(1, Some(100), Some(10.0)),
            candidate(2, Some(50), None),
            candidate(3, None, None),
        ];
        let suspects = build_suspects_list(&cands, Some(&cands[0]), &cands[1..2]);
        assert_eq!(suspects.len(), 3);
        assert_eq!(suspects[0].role, SuspectRole::Primary);
        assert!(suspects[0].evidence_ok);
        assert_eq!(suspects[1].role, SuspectRole::Secondary);
        assert_eq!(suspects[1].evidence_missing, vec![GAP_PIDSTAT_INTERVAL_MISSING]);
        assert_eq!(suspects[2].role, SuspectRole::Candidate);
        assert_eq!(suspects[2].evidence_missing, vec![GAP_PIDSTAT_MISSING]);
    }

    #[test]
    fn narrative_pads_thin_evidence() {
        let narrative = build_narrative(&[], "", &[], &[]);
        assert!(narrative.contains("Observation:"));
        assert!(narrative.contains("(no usable observation summary)"));
        assert!(narrative.contains("evidence chain incomplete"));
        assert!(narrative.contains(GAP_EVIDENCE_INSUFFICIENT));
        assert!(narrative.contains("(no suggested actions)"));
    }

    #[test]
    fn compact_projection_caps_sizes() {
        let mut diag = Diagnosis {
            fault_state: FaultState::Fault,
            family: FaultFamily::Cpu,
            severity: "high".to_string(),
            root_cause: "x".repeat(600),
            confidence: 0.9,
            ..Diagnosis::default()
        };
        for i in 0..12 {
            diag.evidence.push(EvidenceItem::new(format!("item {i}"), "llm_summary"));
        }
        mark_error(&mut diag, "infer_failed", &"m".repeat(300));

        let compact = compact_diagnosis(&diag, &collect_actions());
        let root = compact["root_cause"].as_str().unwrap();
        assert_eq!(root.chars().count(), 503); // 500 + ellipsis
        assert_eq!(compact["evidence"].as_array().unwrap().len(), 8);
        assert_eq!(compact["ok"], json!(false));
        let msg = compact["error"]["message"].as_str().unwrap();
        assert!(msg.chars().count() <= 203);
        assert_eq!(compact["next_checks"].as_array().unwrap().len(), 5);
    }

    #[test]
    fn mark_error_sets_hint_by_kind() {
        let mut diag = Diagnosis::default();
        mark_error(&mut diag, "oom", "CUDA out of memory");
        assert_eq!(diag.ok, Some(false));
        assert!(diag.error.as_ref().unwrap().hint.contains("low_vram_policy"));
        assert_eq!(diag.summary.as_deref(), Some("oom: CUDA out of memory"));
    }
}
