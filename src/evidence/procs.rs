//! Process snapshot and pidstat parsing.
//!
//! Devices ship a coarse process table (`procs/procs_*.txt`, one
//! `pid ppid stat rss_kb comm` line per process) plus optionally two
//! `/proc/<pid>/stat`-format snapshots (`pidstat_0.txt` / `pidstat_1.txt`)
//! taken a short interval apart. Diffing utime+stime between the snapshots
//! yields per-process CPU consumption, which is the strongest ranking
//! signal we have. Everything degrades gracefully when snapshots are
//! missing; the gap is recorded instead of guessed over.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::types::CandidateProcess;

/// Kernel jiffies per second, queried once. Falls back to the common 100
/// when sysconf is unavailable.
pub fn clk_tck() -> i64 {
    static TCK: OnceLock<i64> = OnceLock::new();
    *TCK.get_or_init(|| {
        // SAFETY: sysconf with a valid name constant has no preconditions
        let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if v > 0 {
            v
        } else {
            100
        }
    })
}

/// One row of the coarse process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcEntry {
    pub pid: i64,
    pub ppid: Option<i64>,
    pub stat: String,
    pub rss_kb: Option<i64>,
    pub comm: String,
}

/// Parse `pid ppid stat rss_kb comm...` lines; short or headerless junk is
/// skipped.
pub fn parse_proc_snapshot(lines: &[String]) -> Vec<ProcEntry> {
    let mut out = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 {
            continue;
        }
        let Ok(pid) = parts[0].parse::<i64>() else {
            continue;
        };
        out.push(ProcEntry {
            pid,
            ppid: parts[1].parse().ok(),
            stat: parts[2].to_string(),
            rss_kb: parts[3].parse().ok(),
            comm: parts[4..].join(" "),
        });
    }
    out
}

/// CPU counters for one process at one snapshot instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidstatSample {
    pub pid: i64,
    pub comm: String,
    pub stat: String,
    pub utime: Option<i64>,
    pub stime: Option<i64>,
}

impl PidstatSample {
    fn ticks(&self) -> Option<i64> {
        Some(self.utime? + self.stime?)
    }
}

#[allow(clippy::expect_used)]
fn t_ms_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"t_ms=(\d+)").expect("static pattern"))
}

/// Parse a `/proc/<pid>/stat`-format line. The comm field may contain
/// spaces and parentheses, so the pid prefix and the final `)` anchor the
/// split.
fn parse_proc_stat_raw(raw: &str) -> Option<PidstatSample> {
    let open = raw.find('(')?;
    let close = raw.rfind(')')?;
    if close <= open {
        return None;
    }
    let pid: i64 = raw[..open].split_whitespace().next()?.parse().ok()?;
    let comm = raw[open + 1..close].to_string();
    let rest: Vec<&str> = raw[close + 1..].split_whitespace().collect();
    if rest.len() < 13 {
        return None;
    }
    Some(PidstatSample {
        pid,
        comm,
        stat: rest[0].to_string(),
        utime: rest[11].parse().ok(),
        stime: rest[12].parse().ok(),
    })
}

/// Load one pidstat snapshot: a `# t_ms=<n>` header comment plus one stat
/// line per process, optionally prefixed by a duplicate pid column.
pub fn parse_pidstat_file(path: &Path) -> (HashMap<i64, PidstatSample>, Option<i64>) {
    let mut samples = HashMap::new();
    let mut t_ms = None;

    let Ok(text) = std::fs::read_to_string(path) else {
        return (samples, t_ms);
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(comment) = line.strip_prefix('#') {
            if let Some(cap) = t_ms_re().captures(comment) {
                t_ms = cap.get(1).and_then(|m| m.as_str().parse().ok());
            }
            continue;
        }
        // tolerate a leading "pid " prefix before the stat payload
        let payload = match line.split_once(' ') {
            Some((first, rest)) if first.chars().all(|c| c.is_ascii_digit()) => rest.trim(),
            _ => line,
        };
        let Some(sample) = parse_proc_stat_raw(payload).or_else(|| parse_proc_stat_raw(line))
        else {
            debug!(path = %path.display(), "unparsable pidstat line skipped");
            continue;
        };
        samples.insert(sample.pid, sample);
    }
    (samples, t_ms)
}

/// Snapshot interval: t_ms difference when both headers carry one, else
/// 1000ms when both snapshots exist at all, else unknown.
pub fn pidstat_interval_ms(
    t0: Option<i64>,
    t1: Option<i64>,
    have_both_snapshots: bool,
) -> Option<i64> {
    match (t0, t1) {
        (Some(a), Some(b)) if b > a => Some(b - a),
        _ if have_both_snapshots => Some(1000),
        _ => None,
    }
}

const CANDIDATE_CAP: usize = 80;

/// Join the process table against the pidstat snapshots and rank.
///
/// Order: processes with a CPU delta first (by delta, then rss), then the
/// rest by rss. Negative deltas (counter reset, pid reuse) are discarded.
pub fn build_candidates(
    entries: &[ProcEntry],
    snap0: &HashMap<i64, PidstatSample>,
    snap1: &HashMap<i64, PidstatSample>,
    interval_ms: Option<i64>,
) -> Vec<CandidateProcess> {
    let tck = clk_tck();
    let mut candidates: Vec<CandidateProcess> = Vec::with_capacity(entries.len());

    for entry in entries {
        let cpu_delta = match (snap0.get(&entry.pid), snap1.get(&entry.pid)) {
            (Some(s0), Some(s1)) => match (s0.ticks(), s1.ticks()) {
                (Some(t0), Some(t1)) if t1 >= t0 => Some(t1 - t0),
                _ => None,
            },
            _ => None,
        };
        let cpu_pct = match (cpu_delta, interval_ms) {
            (Some(delta), Some(ms)) if ms > 0 => {
                let pct = delta as f64 / (tck as f64 * (ms as f64 / 1000.0)) * 100.0;
                Some((pct * 100.0).round() / 100.0)
            }
            _ => None,
        };

        let mut signals = Vec::new();
        if cpu_delta.is_some() {
            signals.push("cpu_delta_jiffies".to_string());
        }
        if entry.rss_kb.is_some() {
            signals.push("rss_kb".to_string());
        }
        if !entry.stat.is_empty() {
            signals.push("stat".to_string());
        }

        candidates.push(CandidateProcess {
            pid: entry.pid,
            name: Some(entry.comm.clone()),
            stat: Some(entry.stat.clone()),
            rss_kb: entry.rss_kb,
            cpu_delta_jiffies: cpu_delta,
            cpu_pct,
            score: cpu_delta,
            signals,
            source: if cpu_delta.is_some() { "pidstat" } else { "procs" }.to_string(),
        });
    }

    candidates.sort_by(|a, b| sort_key(b).partial_cmp(&sort_key(a)).unwrap_or(std::cmp::Ordering::Equal));
    candidates.truncate(CANDIDATE_CAP);
    candidates
}

fn sort_key(c: &CandidateProcess) -> (i64, f64, f64) {
    let rss = c.rss_kb.unwrap_or(0) as f64;
    match c.cpu_delta_jiffies {
        Some(delta) => (1, delta as f64, rss),
        None => (0, rss, 0.0),
    }
}
