//! Evidence Builder
//!
//! Turns a run directory into the material the model reasons over: windowed
//! metrics, sanitized events, ranked process candidates, and redacted log
//! excerpts. All loading is best effort; missing artifacts shrink the
//! evidence instead of failing the run, and every gap is recorded.

pub mod events;
pub mod metrics;
pub mod procs;
pub mod prompt;
pub mod redact;

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::fsio::read_lines_tail;
use crate::types::{CandidateProcess, RunMeta};

pub use prompt::build_user_message;

const LOG_TAIL_LINES: usize = 200;
const PROC_TAIL_LINES: usize = 200;
const SECONDARY_SUSPECT_CAP: usize = 5;

/// Everything extracted from one run directory.
#[derive(Debug, Clone)]
pub struct RunEvidence {
    pub run_id: String,
    /// Metadata with label fields removed; safe to serialize into prompts.
    pub meta_safe: Map<String, Value>,
    pub window_start_ms: Option<i64>,
    pub window_end_ms: Option<i64>,
    pub metrics_rows: Vec<metrics::MetricRow>,
    pub metrics_summary: metrics::MetricsSummary,
    pub events: Vec<events::Event>,
    pub candidates: Vec<CandidateProcess>,
    pub primary_suspect: Option<CandidateProcess>,
    pub secondary_suspects: Vec<CandidateProcess>,
    pub observations: Vec<String>,
    pub dmesg_lines: Vec<String>,
    pub applog_lines: Vec<String>,
    pub pidstat_interval_ms: Option<i64>,
    pub clk_tck: i64,
}

/// Serializable record of what went into the prompt, published alongside
/// the diagnosis for replay and audit.
#[derive(Debug, Clone, Serialize)]
pub struct PromptMaterial {
    pub run_id: String,
    pub meta: Map<String, Value>,
    pub window_start_ms: Option<i64>,
    pub window_end_ms: Option<i64>,
    pub metrics_summary: metrics::MetricsSummary,
    pub events_count: usize,
    pub tag_counts: BTreeMap<String, usize>,
    pub candidate_processes: Vec<CandidateProcess>,
    pub primary_suspect: Option<CandidateProcess>,
    pub secondary_suspects: Vec<CandidateProcess>,
    pub dmesg_tail: String,
    pub applog_tail: String,
    pub observations: Vec<String>,
    pub pidstat_interval_ms: Option<i64>,
    pub clk_tck: i64,
}

impl RunEvidence {
    /// Load and assemble all evidence for `run_dir`.
    pub fn build(run_dir: &Path, meta: &RunMeta) -> Self {
        let run_id = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let (window_start_ms, window_end_ms) = resolve_window(meta);

        // metrics: lexicographically last sys_*.csv
        let metrics_rows = match latest_file(&run_dir.join("metrics"), "sys_", ".csv") {
            Some(path) => metrics::window_filter(
                metrics::load_metrics_csv(&path),
                window_start_ms,
                window_end_ms,
            ),
            None => Vec::new(),
        };
        let metrics_summary = metrics::summarize(&metrics_rows);

        let loaded_events = match latest_file(&run_dir.join("events"), "events_", ".jsonl") {
            Some(path) => events::load_events(&path, window_start_ms, window_end_ms),
            None => Vec::new(),
        };

        let procs_dir = run_dir.join("procs");
        let proc_entries = match latest_file(&procs_dir, "procs_", ".txt") {
            Some(path) => {
                let lines: Vec<String> = read_lines_tail(&path, PROC_TAIL_LINES)
                    .into_iter()
                    .filter(|l| !l.trim().is_empty() && !l.starts_with("PID "))
                    .collect();
                procs::parse_proc_snapshot(&lines)
            }
            None => Vec::new(),
        };
        let (snap0, t0_ms) = procs::parse_pidstat_file(&procs_dir.join("pidstat_0.txt"));
        let (snap1, t1_ms) = procs::parse_pidstat_file(&procs_dir.join("pidstat_1.txt"));
        let pidstat_interval_ms =
            procs::pidstat_interval_ms(t0_ms, t1_ms, !snap0.is_empty() && !snap1.is_empty());
        let candidates = procs::build_candidates(&proc_entries, &snap0, &snap1, pidstat_interval_ms);

        let primary_suspect = candidates.first().cloned();
        let secondary_suspects: Vec<CandidateProcess> = candidates
            .iter()
            .skip(1)
            .take(SECONDARY_SUSPECT_CAP)
            .cloned()
            .collect();

        let mut observations = Vec::new();
        if !metrics_rows.is_empty() {
            observations.push(format!("metrics rows in window={}", metrics_rows.len()));
        }
        if !loaded_events.is_empty() {
            observations.push(format!("events in window={}", loaded_events.len()));
        }
        if !proc_entries.is_empty() {
            observations.push(format!("process snapshot entries={}", proc_entries.len()));
        }
        if snap0.is_empty() && snap1.is_empty() {
            observations.push("pidstat_0/1 missing or empty".to_string());
        } else {
            observations.push(format!(
                "pidstat coverage: pidstat_0={} pidstat_1={}",
                snap0.len(),
                snap1.len()
            ));
        }

        let dmesg_lines = read_lines_tail(&run_dir.join("dmesg_after.log"), LOG_TAIL_LINES);
        let applog_lines = read_lines_tail(&run_dir.join("applog_full.log"), LOG_TAIL_LINES);

        debug!(
            run_id = %run_id,
            metrics = metrics_rows.len(),
            events = loaded_events.len(),
            candidates = candidates.len(),
            interval_ms = ?pidstat_interval_ms,
            "evidence assembled"
        );

        Self {
            run_id,
            meta_safe: redact::sanitize_meta(meta),
            window_start_ms,
            window_end_ms,
            metrics_rows,
            metrics_summary,
            events: loaded_events,
            candidates,
            primary_suspect,
            secondary_suspects,
            observations,
            dmesg_lines,
            applog_lines,
            pidstat_interval_ms,
            clk_tck: procs::clk_tck(),
        }
    }

    /// The audit record published as `prompt_material.json`.
    pub fn prompt_material(&self) -> PromptMaterial {
        PromptMaterial {
            run_id: self.run_id.clone(),
            meta: self.meta_safe.clone(),
            window_start_ms: self.window_start_ms,
            window_end_ms: self.window_end_ms,
            metrics_summary: self.metrics_summary.clone(),
            events_count: self.events.len(),
            tag_counts: events::tag_counts(&self.events),
            candidate_processes: self.candidates.clone(),
            primary_suspect: self.primary_suspect.clone(),
            secondary_suspects: self.secondary_suspects.clone(),
            dmesg_tail: redact::redact_label_leaks(&self.dmesg_lines.join("\n")),
            applog_tail: redact::redact_label_leaks(&self.applog_lines.join("\n")),
            observations: self.observations.clone(),
            pidstat_interval_ms: self.pidstat_interval_ms,
            clk_tck: self.clk_tck,
        }
    }
}

/// Window resolution, host-epoch fields first, then the coarse run
/// start/end stamps. Zero means unset.
fn resolve_window(meta: &RunMeta) -> (Option<i64>, Option<i64>) {
    let positive = |v: Option<i64>| v.filter(|ms| *ms > 0);
    let start = positive(meta.get_int("run_window_host_epoch_ms_start"))
        .or_else(|| positive(meta.get_int("run_start")))
        .or_else(|| positive(meta.get_int("host_epoch_ms_start")));
    let end = positive(meta.get_int("run_window_host_epoch_ms_end"))
        .or_else(|| positive(meta.get_int("run_end")));
    (start, end)
}

/// Lexicographically last `<prefix>*<suffix>` file in `dir`.
fn latest_file(dir: &Path, prefix: &str, suffix: &str) -> Option<std::path::PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
        .collect();
    names.sort();
    names.pop().map(|n| dir.join(n))
}
