//! System-metrics CSV loading and windowing.
//!
//! Devices sample a small fixed set of gauges into `metrics/sys_*.csv`.
//! Parsing is deliberately lenient: unknown columns are ignored, malformed
//! cells read as absent, and a window filter that matches nothing falls back
//! to the full series rather than starving the prompt of data.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// One metrics sample. All fields optional; devices differ in what they
/// actually emit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRow {
    pub ts_ms: Option<i64>,
    pub load1_x100: Option<i64>,
    pub cpu_util_total_x100: Option<i64>,
    pub mem_free_kb: Option<i64>,
    pub mem_available_kb: Option<i64>,
}

/// Lenient integer cell parse (`"12"`, `"12.7"`, junk -> None).
pub fn parse_cell(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|f| f as i64))
}

/// Load the header-addressed CSV, skipping rows that do not parse at all.
pub fn load_metrics_csv(path: &Path) -> Vec<MetricRow> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut lines = text.lines();
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut row = MetricRow::default();
        for (col, cell) in columns.iter().zip(line.split(',')) {
            let value = parse_cell(cell);
            match *col {
                "ts_ms" => row.ts_ms = value,
                "load1_x100" => row.load1_x100 = value,
                "cpu_util_total_x100" => row.cpu_util_total_x100 = value,
                "mem_free_kb" => row.mem_free_kb = value,
                "mem_available_kb" => row.mem_available_kb = value,
                _ => {}
            }
        }
        rows.push(row);
    }
    rows
}

/// Restrict rows to the run window. Invalid bounds (absent or <= 0) keep
/// everything; an empty intersection also keeps everything.
pub fn window_filter(rows: Vec<MetricRow>, start_ms: Option<i64>, end_ms: Option<i64>) -> Vec<MetricRow> {
    let (Some(start), Some(end)) = (start_ms, end_ms) else {
        return rows;
    };
    if start <= 0 || end <= 0 {
        return rows;
    }
    let windowed: Vec<MetricRow> = rows
        .iter()
        .filter(|row| row.ts_ms.is_some_and(|ts| start <= ts && ts <= end))
        .cloned()
        .collect();
    if windowed.is_empty() {
        rows
    } else {
        windowed
    }
}

/// Min/max over present values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

pub fn calc_stats(values: impl Iterator<Item = Option<i64>>) -> Stats {
    let mut stats = Stats::default();
    for value in values.flatten() {
        stats.min = Some(stats.min.map_or(value, |m| m.min(value)));
        stats.max = Some(stats.max.map_or(value, |m| m.max(value)));
    }
    stats
}

/// Aggregate view of the windowed series, as quoted in prompts and kept in
/// the prompt-material record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub rows: usize,
    pub load1: Stats,
    pub cpu_util: Stats,
    pub mem_free_kb: Stats,
    pub mem_available_kb: Stats,
    /// max - min of mem_available_kb over the window.
    pub mem_avail_drop_kb: Option<i64>,
}

pub fn summarize(rows: &[MetricRow]) -> MetricsSummary {
    let mem_avail = calc_stats(rows.iter().map(|r| r.mem_available_kb));
    let mem_avail_drop_kb = match (mem_avail.min, mem_avail.max) {
        (Some(min), Some(max)) => Some(max - min),
        _ => None,
    };
    MetricsSummary {
        rows: rows.len(),
        load1: calc_stats(rows.iter().map(|r| r.load1_x100)),
        cpu_util: calc_stats(rows.iter().map(|r| r.cpu_util_total_x100)),
        mem_free_kb: calc_stats(rows.iter().map(|r| r.mem_free_kb)),
        mem_available_kb: mem_avail,
        mem_avail_drop_kb,
    }
}
