//! Prompt rendering.
//!
//! The user message shown to the model follows a fixed section layout so
//! downstream parsing and human review both stay predictable. Every line of
//! free text passes through redaction first.

use serde_json::Value;

use super::metrics::MetricRow;
use super::redact::redact_label_leaks;
use super::{events, RunEvidence};
use crate::types::CandidateProcess;

const METRIC_SAMPLE_CAP: usize = 16;
const EVENT_SAMPLE_CAP: usize = 8;
const PROCESS_EVIDENCE_CAP: usize = 8;
const LOG_EXCERPT_CAP: usize = 20;

/// Render the complete evidence prompt for one run.
pub fn build_user_message(ev: &RunEvidence) -> String {
    let mut lines: Vec<String> = Vec::new();

    lines.push(format!("[run_id] {}", ev.run_id));
    lines.push(format!(
        "[script_version] {}",
        meta_display(&ev.meta_safe, "script_version")
    ));
    lines.push(format!(
        "[run_window_source] {}",
        meta_display(&ev.meta_safe, "run_window_source")
    ));
    lines.push(format!(
        "[run_window_board_ms] start={}, end={}",
        meta_display(&ev.meta_safe, "run_window_board_ms_start"),
        meta_display(&ev.meta_safe, "run_window_board_ms_end"),
    ));
    lines.push(
        "[NOTE] Use only metrics/events/procs/dmesg/applog evidence; do not use scenario tags or obs_* fields."
            .to_string(),
    );

    render_metrics(&mut lines, ev);
    render_events(&mut lines, ev);
    render_process_evidence(&mut lines, &ev.candidates);
    render_log_excerpt(&mut lines, "[dmesg excerpt] (truncated)", &ev.dmesg_lines);
    render_log_excerpt(&mut lines, "[applog excerpt] (truncated)", &ev.applog_lines);

    lines.push(String::new());
    lines.push("Please answer:".to_string());
    lines.push("1) Is this run faulty? If yes, which family (cpu/mem/background/other)?".to_string());
    lines.push("2) 2-4 root-cause evidence items (cite metrics/events/processes)".to_string());
    lines.push("3) 1-2 actionable checks or fixes".to_string());
    lines.push("4) Confidence (0-1)".to_string());
    lines.push(
        "Primary_suspect must include pid and must be selected from PROCESS_EVIDENCE; do not invent pids or processes."
            .to_string(),
    );
    lines.push(
        "root_cause should cite evidence (metrics + PROCESS_EVIDENCE), but does not need to force pid= format."
            .to_string(),
    );
    lines.join("\n")
}

fn meta_display(meta: &serde_json::Map<String, Value>, key: &str) -> String {
    match meta.get(key) {
        None | Some(Value::Null) => "None".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn opt_display<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |v| v.to_string())
}

fn render_metrics(lines: &mut Vec<String>, ev: &RunEvidence) {
    if ev.metrics_rows.is_empty() {
        lines.push("[metrics] no valid metrics rows".to_string());
        return;
    }
    let summary = &ev.metrics_summary;

    lines.push("[metrics window]".to_string());
    lines.push(format!(
        "  start_ms={}, end_ms={}, rows={}",
        opt_display(ev.window_start_ms),
        opt_display(ev.window_end_ms),
        ev.metrics_rows.len(),
    ));

    lines.push("[metrics summary]".to_string());
    lines.push(format!("  load1_peak_x100={}", opt_display(summary.load1.max)));
    lines.push(format!("  cpu_util_peak_x100={}", opt_display(summary.cpu_util.max)));
    lines.push(format!(
        "  mem_available_kb: min={} max={} drop_kb={}",
        opt_display(summary.mem_available_kb.min),
        opt_display(summary.mem_available_kb.max),
        opt_display(summary.mem_avail_drop_kb),
    ));
    lines.push(format!(
        "  mem_free_kb: min={} max={}",
        opt_display(summary.mem_free_kb.min),
        opt_display(summary.mem_free_kb.max),
    ));

    lines.push(
        "[metrics samples] (relative seconds, mem_available_kb, load1_x100, cpu_util_total_x100)"
            .to_string(),
    );
    let origin_ms = ev
        .window_start_ms
        .or_else(|| ev.metrics_rows.first().and_then(|r| r.ts_ms));
    for row in ev.metrics_rows.iter().take(METRIC_SAMPLE_CAP) {
        lines.push(render_sample(row, origin_ms));
    }
}

fn render_sample(row: &MetricRow, origin_ms: Option<i64>) -> String {
    let t = match (row.ts_ms, origin_ms) {
        (Some(ts), Some(origin)) => format!("+{:.1}s", (ts - origin) as f64 / 1000.0),
        (ts, _) => opt_display(ts),
    };
    format!(
        "  t={t}, mem_available_kb={}, load1_x100={}, cpu_util_total_x100={}",
        opt_display(row.mem_available_kb),
        opt_display(row.load1_x100),
        opt_display(row.cpu_util_total_x100),
    )
}

fn render_events(lines: &mut Vec<String>, ev: &RunEvidence) {
    if ev.events.is_empty() {
        lines.push("[events] none".to_string());
        return;
    }
    let counts = events::tag_counts(&ev.events);
    lines.push("[events summary]".to_string());
    lines.push(format!(
        "  total={}, cpu_hotspot={}, mem_pressure={}, io_pressure={}",
        ev.events.len(),
        counts.get("cpu_hotspot").copied().unwrap_or(0),
        counts.get("mem_pressure").copied().unwrap_or(0),
        counts.get("io_pressure").copied().unwrap_or(0),
    ));
    let rendered: Vec<String> = counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
    lines.push(format!("  tag_counts={{{}}}", rendered.join(", ")));

    lines.push("[events samples] (truncated)".to_string());
    for event in ev.events.iter().take(EVENT_SAMPLE_CAP) {
        let field = |key: &str| {
            event
                .get(key)
                .map_or_else(|| "None".to_string(), |v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
        };
        lines.push(format!(
            "  ts={}, level={}, component={}, tag={}, msg={}",
            field("ts"),
            field("level"),
            field("component"),
            field("tag"),
            redact_label_leaks(&field("msg")),
        ));
    }
}

/// Structured candidate lines; raw ps/top text never reaches the prompt.
fn render_process_evidence(lines: &mut Vec<String>, candidates: &[CandidateProcess]) {
    if candidates.is_empty() {
        lines.push("[PROCESS_EVIDENCE] (no usable process candidates)".to_string());
        return;
    }
    lines.push("[PROCESS_EVIDENCE] (procs snapshot + pidstat delta)".to_string());
    for cand in candidates.iter().take(PROCESS_EVIDENCE_CAP) {
        let name = cand.name.as_deref().unwrap_or("proc");
        let mut parts = vec![format!("pid={}", cand.pid)];
        if let Some(rss) = cand.rss_kb {
            parts.push(format!("rss_kb={rss}"));
        }
        if let Some(stat) = cand.stat.as_deref().filter(|s| !s.is_empty()) {
            parts.push(format!("stat={stat}"));
        }
        if let Some(delta) = cand.cpu_delta_jiffies {
            parts.push(format!("cpu_delta_jiffies={delta}"));
        }
        if let Some(pct) = cand.cpu_pct {
            parts.push(format!("cpu_pct={pct}"));
        }
        lines.push(format!("  - {name}({})", parts.join(", ")));
    }
}

fn render_log_excerpt(lines: &mut Vec<String>, header: &str, excerpt: &[String]) {
    if excerpt.is_empty() {
        return;
    }
    lines.push(header.to_string());
    for line in excerpt.iter().take(LOG_EXCERPT_CAP) {
        lines.push(format!("  {}", redact_label_leaks(line)));
    }
}
