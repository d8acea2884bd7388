//! Core data model for the diagnosis pipeline.
//!
//! The diagnosis/actions/notes artifacts are tagged structs with explicit
//! optional fields and a `schema_version` so downstream consumers can evolve
//! independently of the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current artifact schema version.
pub const SCHEMA_VERSION: u32 = 1;

// ============================================================================
// Fault Classification
// ============================================================================

/// Overall fault judgment for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultState {
    #[default]
    Unknown,
    Normal,
    Fault,
}

impl std::fmt::Display for FaultState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultState::Unknown => write!(f, "unknown"),
            FaultState::Normal => write!(f, "normal"),
            FaultState::Fault => write!(f, "fault"),
        }
    }
}

/// Fault family classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FaultFamily {
    Cpu,
    Mem,
    Background,
    Net,
    Io,
    #[default]
    Other,
}

impl std::fmt::Display for FaultFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultFamily::Cpu => write!(f, "cpu"),
            FaultFamily::Mem => write!(f, "mem"),
            FaultFamily::Background => write!(f, "background"),
            FaultFamily::Net => write!(f, "net"),
            FaultFamily::Io => write!(f, "io"),
            FaultFamily::Other => write!(f, "other"),
        }
    }
}

impl FaultFamily {
    /// Parse a family token ("cpu", "mem", ...) leniently.
    pub fn parse_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "cpu" => FaultFamily::Cpu,
            "mem" | "memory" => FaultFamily::Mem,
            "background" | "bg" => FaultFamily::Background,
            "net" | "network" => FaultFamily::Net,
            "io" => FaultFamily::Io,
            _ => FaultFamily::Other,
        }
    }
}

// ============================================================================
// Evidence & Suspects
// ============================================================================

/// A single evidence item cited by a diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub text: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gaps: Vec<String>,
}

impl EvidenceItem {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            gaps: Vec::new(),
        }
    }

    pub fn with_gap(mut self, gap: impl Into<String>) -> Self {
        self.gaps.push(gap.into());
        self
    }
}

/// Evidence gap marker: suspect PID had no pidstat coverage.
pub const GAP_PIDSTAT_MISSING: &str = "pidstat_missing";
/// Evidence gap marker: CPU delta exists but no interval to convert to %.
pub const GAP_PIDSTAT_INTERVAL_MISSING: &str = "pidstat_interval_missing";
/// Evidence gap marker: fewer than two evidence items were available.
pub const GAP_EVIDENCE_INSUFFICIENT: &str = "evidence_insufficient";

/// Process-level fault candidate derived by diffing two CPU snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProcess {
    pub pid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_kb: Option<i64>,
    /// CPU ticks consumed between the two snapshots.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_delta_jiffies: Option<i64>,
    /// CPU percentage over the snapshot interval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<String>,
    /// "pidstat" when a CPU delta was available, else "procs".
    pub source: String,
}

/// Role a suspect plays in the ranked list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuspectRole {
    Primary,
    Secondary,
    Candidate,
}

/// A ranked suspect process with explicit evidence-gap accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspectProcess {
    pub pid: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: SuspectRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss_kb: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    pub evidence_ok: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_missing: Vec<String>,
}

// ============================================================================
// Diagnosis
// ============================================================================

/// Structured error attached to a failed diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub hint: String,
}

/// The normalized diagnosis verdict for one run.
///
/// Invariant: `fault_state == Normal` implies `severity == "normal"`;
/// enforced by [`Diagnosis::enforce_severity_invariant`] before any emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub schema_version: u32,
    pub fault_state: FaultState,
    pub family: FaultFamily,
    pub severity: String,
    pub root_cause: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub evidence_text: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub risk_flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DiagnosisError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observations: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hypothesis: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suspects: Vec<SuspectProcess>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidate_processes: Vec<CandidateProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_suspect: Option<CandidateProcess>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_suspects: Vec<CandidateProcess>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub narrative: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clk_tck: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pidstat_interval_ms: Option<i64>,
}

impl Default for Diagnosis {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            fault_state: FaultState::Unknown,
            family: FaultFamily::Other,
            severity: "unknown".to_string(),
            root_cause: String::new(),
            evidence: Vec::new(),
            evidence_text: Vec::new(),
            confidence: 0.0,
            risk_flags: Vec::new(),
            ok: None,
            error: None,
            summary: None,
            observations: Vec::new(),
            hypothesis: String::new(),
            suspects: Vec::new(),
            candidate_processes: Vec::new(),
            primary_suspect: None,
            secondary_suspects: Vec::new(),
            narrative: String::new(),
            clk_tck: None,
            pidstat_interval_ms: None,
        }
    }
}

impl Diagnosis {
    /// A diagnosis with the given risk flag and nothing else resolved.
    pub fn unresolved(risk_flag: &str) -> Self {
        Self {
            risk_flags: vec![risk_flag.to_string()],
            ..Self::default()
        }
    }

    /// Append a risk flag, deduplicating.
    pub fn append_risk_flag(&mut self, flag: &str) {
        if flag.is_empty() {
            return;
        }
        if !self.risk_flags.iter().any(|f| f == flag) {
            self.risk_flags.push(flag.to_string());
        }
    }

    /// A normal verdict always carries normal severity.
    pub fn enforce_severity_invariant(&mut self) {
        if self.fault_state == FaultState::Normal
            && self.severity != "normal"
            && self.severity != "none"
        {
            self.severity = "normal".to_string();
        }
    }
}

/// Risk flag set when stage-2 inherits stage-1 because of VRAM pressure or
/// an accelerator OOM.
pub const FLAG_GPU_FALLBACK: &str = "gpu_oom_or_low_mem_fallback";
/// Risk flag set when inference failed for a non-OOM reason.
pub const FLAG_INFERENCE_FAILED: &str = "inference_failed";

// ============================================================================
// Actions
// ============================================================================

/// One remediation/collection command for the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub cmd: String,
    pub timeout_sec: u64,
    pub risk: String,
    pub why: String,
}

/// Ordered action script for one run. Never empty on a terminal run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSet {
    pub schema_version: u32,
    pub actions: Vec<Action>,
}

impl Default for ActionSet {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            actions: Vec::new(),
        }
    }
}

impl ActionSet {
    /// Rewrite the provenance tag on every action that carries `old`.
    pub fn rewrite_why(&mut self, old: &str, new: &str) {
        for action in &mut self.actions {
            if action.why == old {
                action.why = new.to_string();
            }
        }
    }

    /// Device-side rendering: one command per line.
    pub fn to_device_script(&self) -> String {
        let mut out = String::new();
        for action in &self.actions {
            out.push_str(&action.cmd);
            out.push('\n');
        }
        out
    }
}

// ============================================================================
// Notes
// ============================================================================

/// Free-form companion record to a diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notes {
    pub schema_version: u32,
    #[serde(default)]
    pub actions_manual: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl Default for Notes {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            actions_manual: Vec::new(),
            summary: String::new(),
        }
    }
}

// ============================================================================
// Run Metadata
// ============================================================================

/// Run metadata record (`_run_meta.json`).
///
/// Backed by a JSON map so device-supplied fields survive a round trip
/// untouched. All merge operations use set-if-absent semantics; ingestion
/// backfills once and the record is read-only afterwards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunMeta {
    map: Map<String, Value>,
}

impl RunMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self { map }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    /// Integer field, tolerating numeric strings with embedded junk
    /// (e.g. .NET-style `/Date(1700000000000)/` values).
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.map.get(key).and_then(value_as_int)
    }

    /// Set the field only when absent.
    pub fn set_default(&mut self, key: &str, value: Value) {
        self.map.entry(key.to_string()).or_insert(value);
    }

    /// Set the field unconditionally.
    pub fn set(&mut self, key: &str, value: Value) {
        self.map.insert(key.to_string(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.map.iter()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.get_str("run_id")
    }

    /// Device identity, preferring the serial-number field.
    pub fn device_id(&self) -> Option<&str> {
        self.get_str("device_sn").or_else(|| self.get_str("device_id"))
    }
}

/// Lenient integer extraction: numbers pass through, strings are stripped
/// to their digit runs.
pub fn value_as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                None
            } else {
                digits.parse().ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fault_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&FaultState::Fault).unwrap(), "\"fault\"");
        assert_eq!(serde_json::to_string(&FaultFamily::Background).unwrap(), "\"background\"");
    }

    #[test]
    fn family_token_parsing() {
        assert_eq!(FaultFamily::parse_token("CPU"), FaultFamily::Cpu);
        assert_eq!(FaultFamily::parse_token("memory"), FaultFamily::Mem);
        assert_eq!(FaultFamily::parse_token("bg"), FaultFamily::Background);
        assert_eq!(FaultFamily::parse_token("weird"), FaultFamily::Other);
    }

    #[test]
    fn normal_forces_normal_severity() {
        let mut diag = Diagnosis {
            fault_state: FaultState::Normal,
            severity: "high".to_string(),
            ..Diagnosis::default()
        };
        diag.enforce_severity_invariant();
        assert_eq!(diag.severity, "normal");

        // "none" is accepted as an already-benign severity
        let mut diag = Diagnosis {
            fault_state: FaultState::Normal,
            severity: "none".to_string(),
            ..Diagnosis::default()
        };
        diag.enforce_severity_invariant();
        assert_eq!(diag.severity, "none");
    }

    #[test]
    fn risk_flags_deduplicate() {
        let mut diag = Diagnosis::default();
        diag.append_risk_flag(FLAG_GPU_FALLBACK);
        diag.append_risk_flag(FLAG_GPU_FALLBACK);
        assert_eq!(diag.risk_flags.len(), 1);
    }

    #[test]
    fn run_meta_set_default_never_overwrites() {
        let mut meta = RunMeta::new();
        meta.set("run_id", json!("r1"));
        meta.set_default("run_id", json!("r2"));
        assert_eq!(meta.run_id(), Some("r1"));
        meta.set_default("scenario_tag", json!("demo_manual"));
        assert_eq!(meta.get_str("scenario_tag"), Some("demo_manual"));
    }

    #[test]
    fn value_as_int_strips_wrappers() {
        assert_eq!(value_as_int(&json!(42)), Some(42));
        assert_eq!(value_as_int(&json!("/Date(1700000000000)/")), Some(1_700_000_000_000));
        assert_eq!(value_as_int(&json!("no digits")), None);
    }

    #[test]
    fn action_set_rewrite_why() {
        let mut set = ActionSet {
            schema_version: SCHEMA_VERSION,
            actions: vec![Action {
                kind: "collect".to_string(),
                target: "device".to_string(),
                cmd: "cat /proc/loadavg".to_string(),
                timeout_sec: 20,
                risk: "low".to_string(),
                why: "fallback_collect".to_string(),
            }],
        };
        set.rewrite_why("fallback_collect", "stage2_collect");
        assert_eq!(set.actions[0].why, "stage2_collect");
    }
}
