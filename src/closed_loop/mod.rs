//! Closed-Loop Runner
//!
//! Drives one run directory through the full inference pipeline: evidence,
//! stage-1 reasoning, the optional stage-2 refinement pass, and the
//! artifact set the watcher publishes from. Every terminal path produces a
//! complete, size-bounded artifact set; inference failure degrades to the
//! deterministic collection fallback instead of leaving the run empty.
//!
//! Artifacts written under `<run_dir>/_server_out/`:
//!
//! - `prompt_material.json`, `llm_input.jsonl` (audit of model input)
//! - `diagnosis.json` (compact), `actions.json`, `notes.json` (stage-1)
//! - `diagnosis_v2.json` (full), `actions_v2.json`, `notes_v2.json`
//! - `actions_device.txt` (one command per line, for the device)
//! - `raw_model_output.txt`, `infer_error.txt`, `infer_ec.txt`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::diagnosis::{self, WHY_FALLBACK_COLLECT, WHY_STAGE2_COLLECT};
use crate::evidence::{build_user_message, RunEvidence};
use crate::fsio::{
    atomic_write, atomic_write_json, read_text_tail_bytes, release_lock, try_acquire_lock,
};
use crate::gpu::{GateDecision, GateParams, GpuMemoryProbe, StageController};
use crate::infer::{load_system_prompt, sanitize_reply, ChatMessage, InferError, InferenceEngine};
use crate::types::{
    ActionSet, Diagnosis, Notes, RunMeta, FLAG_GPU_FALLBACK, FLAG_INFERENCE_FAILED,
};

/// Stage-2 skip reason when the refinement pass is off in configuration.
pub const REASON_DISABLED: &str = "disabled_by_config";
/// Stage-2 skip reason on memory pressure.
pub const REASON_LOW_VRAM: &str = "low_vram_fallback";

/// Outcome of one closed-loop invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum LoopStatus {
    /// Artifacts written; the device action script is at the given path.
    Completed { actions_device: PathBuf },
    /// Another invocation holds the run lock; nothing was touched.
    SkippedLocked,
}

/// Runs the two-stage diagnosis pipeline for one run directory at a time.
pub struct ClosedLoopRunner {
    config: ServerConfig,
    engine: Arc<dyn InferenceEngine>,
    controller: StageController,
    system_prompt: String,
}

impl ClosedLoopRunner {
    pub fn new(
        config: ServerConfig,
        engine: Arc<dyn InferenceEngine>,
        probe: Arc<dyn GpuMemoryProbe>,
    ) -> Self {
        let system_prompt = load_system_prompt(config.system_prompt_jsonl.as_deref());
        let controller = StageController::new(probe, config.low_vram_policy);
        Self {
            config,
            engine,
            controller,
            system_prompt,
        }
    }

    fn stage1_params(&self) -> GateParams {
        GateParams {
            min_free_mib: self.config.min_free_mib,
            poll_secs: self.config.wait_poll_secs,
            max_wait_secs: self.config.wait_max_secs,
            grace_secs: self.config.low_vram_wait_secs,
        }
    }

    fn stage2_params(&self) -> GateParams {
        GateParams {
            min_free_mib: self.config.min_free_mib_stage2,
            poll_secs: self.config.stage2_wait_poll_secs(),
            max_wait_secs: self.config.stage2_wait_max_secs,
            grace_secs: self.config.low_vram_wait_secs,
        }
    }

    /// Process one run directory end to end.
    pub async fn run(&self, run_dir: &Path) -> Result<LoopStatus> {
        let out_dir = run_dir.join("_server_out");
        std::fs::create_dir_all(&out_dir)
            .with_context(|| format!("create {}", out_dir.display()))?;

        let Some(lock) = try_acquire_lock(&out_dir) else {
            info!(run_dir = %run_dir.display(), "run lock held; skipping");
            return Ok(LoopStatus::SkippedLocked);
        };
        let result = self.run_locked(run_dir, &out_dir).await;
        release_lock(&lock);
        result
    }

    async fn run_locked(&self, run_dir: &Path, out_dir: &Path) -> Result<LoopStatus> {
        let meta: RunMeta = std::fs::read_to_string(run_dir.join("_run_meta.json"))
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let ev = RunEvidence::build(run_dir, &meta);

        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(build_user_message(&ev)),
        ];
        atomic_write_json(&out_dir.join("prompt_material.json"), &ev.prompt_material())?;
        let input_record =
            serde_json::to_string(&serde_json::json!({ "messages": &messages }))? + "\n";
        atomic_write(&out_dir.join("llm_input.jsonl"), input_record.as_bytes())?;

        self.controller.log_snapshot().await;

        let mut skip_stage2 = false;
        let mut skip_reason = String::new();
        if !self.config.enable_stage2 {
            skip_stage2 = true;
            skip_reason = REASON_DISABLED.to_string();
            info!("stage-2 disabled by config");
        }

        // stage-1 gate never blocks stage-1 itself; a negative outcome only
        // pre-marks stage-2 for inheritance
        if self.controller.gate("stage1", self.stage1_params()).await == GateDecision::SkipStage2
            && !skip_stage2
        {
            skip_stage2 = true;
            skip_reason = REASON_LOW_VRAM.to_string();
        }

        let mut raw_output = String::new();
        let mut stage1_failed = false;

        let (mut diag, actions, notes) = match self.run_stage(&messages).await {
            Ok((analysis, summary)) => {
                raw_output.push_str(&format!(
                    "### stage1_analysis\n{analysis}\n\n### stage1_summary\n{summary}\n"
                ));
                let (diag, notes) = diagnosis::parse_summary(&sanitize_reply(&summary), "unknown");
                (diag, diagnosis::collect_actions(), notes)
            }
            Err(err) => {
                stage1_failed = true;
                let message = err.to_string();
                warn!(error = %message, oom = err.is_oom(), "stage-1 inference failed");
                raw_output.push_str(&message);
                raw_output.push('\n');
                atomic_write(&out_dir.join("infer_error.txt"), message.as_bytes())?;

                let (flag, summary, kind) = if err.is_oom() {
                    (FLAG_GPU_FALLBACK, "stage1_failed: oom_fallback", "oom")
                } else {
                    (FLAG_INFERENCE_FAILED, "inference_failed", "infer_failed")
                };
                let (mut diag, actions) = diagnosis::fallback_result(flag);
                diagnosis::mark_error(&mut diag, kind, &message);
                let notes = Notes {
                    summary: summary.to_string(),
                    ..Notes::default()
                };
                (diag, actions, notes)
            }
        };

        let (mut diag_v2, actions_v2, notes_v2) = if stage1_failed {
            self.inherit_failed(&diag, &actions, &notes)
        } else if skip_stage2 {
            self.inherit_skipped(&diag, &actions, &notes, &skip_reason)
        } else {
            match self
                .run_stage2(out_dir, &mut raw_output, &diag.severity)
                .await
            {
                Stage2Outcome::Skipped(reason) => {
                    self.inherit_skipped(&diag, &actions, &notes, &reason)
                }
                Stage2Outcome::Completed(triple) => triple,
                Stage2Outcome::Failed(err) => {
                    let message = err.to_string();
                    warn!(error = %message, oom = err.is_oom(), "stage-2 inference failed");
                    let mut diag_v2 = diag.clone();
                    let actions_v2 = actions.clone();
                    let mut notes_v2 = notes.clone();
                    if err.is_oom() {
                        diag_v2.append_risk_flag(FLAG_GPU_FALLBACK);
                        notes_v2.summary = "stage2_failed: oom_fallback_to_stage1".to_string();
                    } else {
                        notes_v2.summary = format!("stage2_failed: {message}");
                    }
                    (diag_v2, actions_v2, notes_v2)
                }
            }
        };

        // final enrichment applies to both stages no matter how they ended
        diagnosis::enrich(&mut diag, &ev, &actions);
        diagnosis::enrich(&mut diag_v2, &ev, &actions_v2);

        atomic_write_json(
            &out_dir.join("diagnosis.json"),
            &diagnosis::compact_diagnosis(&diag_v2, &actions_v2),
        )?;
        atomic_write_json(&out_dir.join("actions.json"), &actions)?;
        atomic_write_json(&out_dir.join("notes.json"), &notes)?;
        atomic_write_json(&out_dir.join("diagnosis_v2.json"), &diag_v2)?;
        atomic_write_json(&out_dir.join("actions_v2.json"), &actions_v2)?;
        atomic_write_json(&out_dir.join("notes_v2.json"), &notes_v2)?;
        atomic_write(&out_dir.join("raw_model_output.txt"), raw_output.as_bytes())?;
        atomic_write(&out_dir.join("infer_ec.txt"), b"0\n")?;

        let actions_device = out_dir.join("actions_device.txt");
        atomic_write(&actions_device, actions.to_device_script().as_bytes())?;

        info!(
            run_id = %ev.run_id,
            fault_state = %diag_v2.fault_state,
            family = %diag_v2.family,
            engine = self.engine.engine_name(),
            "closed loop completed"
        );
        Ok(LoopStatus::Completed { actions_device })
    }

    /// reason then summarize, as one fallible unit.
    async fn run_stage(&self, messages: &[ChatMessage]) -> Result<(String, String), InferError> {
        let analysis = self.engine.reason(messages).await?;
        let summary = self.engine.summarize(&analysis).await?;
        Ok((analysis, summary))
    }

    async fn run_stage2(
        &self,
        out_dir: &Path,
        raw_output: &mut String,
        stage1_severity: &str,
    ) -> Stage2Outcome {
        // stage-2 headroom gate, smaller threshold and its own timeout
        if self.controller.gate("stage2", self.stage2_params()).await == GateDecision::SkipStage2 {
            return Stage2Outcome::Skipped(REASON_LOW_VRAM.to_string());
        }

        let tail = |name: &str| {
            read_text_tail_bytes(
                &out_dir.join(name),
                self.config.stage2_tail_bytes,
                self.config.stage2_tail_lines,
            )
        };
        let prompt_text = tail("prompt_material.json");
        let llm_text = tail("llm_input.jsonl");
        let mut exec_text = tail("actions_exec.log");
        if exec_text.is_empty() {
            exec_text = "(actions_exec.log missing or empty)".to_string();
        }

        let stage2_user = format!(
            "[prompt_material.json]\n{prompt_text}\n\n\
             [llm_input.jsonl]\n{llm_text}\n\n\
             [actions_exec.log tail]\n{exec_text}\n\n\
             Please produce structured diagnosis and suggestions based on the above.\n"
        );
        let messages = vec![
            ChatMessage::system(&self.system_prompt),
            ChatMessage::user(stage2_user),
        ];

        match self.run_stage(&messages).await {
            Err(err) => Stage2Outcome::Failed(err),
            Ok((analysis, summary)) => {
                raw_output.push_str(&format!(
                    "\n### stage2_analysis\n{analysis}\n\n### stage2_summary\n{summary}\n"
                ));
                let (mut diag_v2, mut notes_v2) =
                    diagnosis::parse_summary(&sanitize_reply(&summary), "unknown");
                // the refinement pass inherits stage-1 severity when it
                // declines to state one
                if diag_v2.severity.is_empty() || diag_v2.severity == "unknown" {
                    diag_v2.severity = stage1_severity.to_string();
                }
                diag_v2.enforce_severity_invariant();

                let mut actions_v2 = diagnosis::collect_actions();
                actions_v2.rewrite_why(WHY_FALLBACK_COLLECT, WHY_STAGE2_COLLECT);
                notes_v2.summary = format!(
                    "stage2_ok: {}/{}/{}",
                    diag_v2.fault_state, diag_v2.family, diag_v2.severity
                );
                Stage2Outcome::Completed((diag_v2, actions_v2, notes_v2))
            }
        }
    }

    /// Stage-2 inherits stage-1 verbatim; only the VRAM path gets the risk
    /// flag, a config disable stays unflagged.
    fn inherit_skipped(
        &self,
        diag: &Diagnosis,
        actions: &ActionSet,
        notes: &Notes,
        reason: &str,
    ) -> (Diagnosis, ActionSet, Notes) {
        let mut diag_v2 = diag.clone();
        let mut notes_v2 = notes.clone();
        notes_v2.summary = format!("stage2_skipped: {reason}");
        if reason == REASON_LOW_VRAM {
            diag_v2.append_risk_flag(FLAG_GPU_FALLBACK);
        }
        info!(reason, "stage-2 skipped, inheriting stage-1");
        (diag_v2, actions.clone(), notes_v2)
    }

    fn inherit_failed(
        &self,
        diag: &Diagnosis,
        actions: &ActionSet,
        notes: &Notes,
    ) -> (Diagnosis, ActionSet, Notes) {
        let mut notes_v2 = notes.clone();
        if notes_v2.summary == "inference_failed" {
            notes_v2.summary = "stage2_skipped: inference_failed".to_string();
        }
        (diag.clone(), actions.clone(), notes_v2)
    }
}

enum Stage2Outcome {
    Completed((Diagnosis, ActionSet, Notes)),
    Skipped(String),
    Failed(InferError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::GpuMemInfo;
    use crate::types::{FaultFamily, FaultState};
    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    struct ScriptedEngine {
        reply: Result<String, String>,
        stage2_reply: Option<Result<String, String>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedEngine {
        fn ok(reply: &str) -> Self {
            Self {
                reply: Ok(reply.to_string()),
                stage2_reply: None,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                reply: Err(message.to_string()),
                stage2_reply: None,
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        fn with_stage2(mut self, reply: &str) -> Self {
            self.stage2_reply = Some(Ok(reply.to_string()));
            self
        }
    }

    #[async_trait]
    impl InferenceEngine for ScriptedEngine {
        async fn reason(&self, _messages: &[ChatMessage]) -> Result<String, InferError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let reply = if call > 0 {
                self.stage2_reply.as_ref().unwrap_or(&self.reply)
            } else {
                &self.reply
            };
            reply
                .clone()
                .map_err(InferError::from_message)
        }

        async fn summarize(&self, analysis: &str) -> Result<String, InferError> {
            Ok(analysis.to_string())
        }

        fn engine_name(&self) -> &'static str {
            "scripted"
        }
    }

    struct FixedProbe(u64);

    #[async_trait]
    impl GpuMemoryProbe for FixedProbe {
        async fn query(&self) -> Result<GpuMemInfo, String> {
            Ok(GpuMemInfo {
                free_mib: self.0,
                used_mib: 0,
                total_mib: 24_000,
            })
        }
    }

    const FAULT_SUMMARY: &str = "\
1. fault_state: fault
family: cpu
2. evidence:
- busyproc pegged a core
- load1 spiked
3. checks:
- top -n 1
4. confidence: 0.7
";

    fn seed_run(dir: &Path) {
        std::fs::create_dir_all(dir.join("metrics")).unwrap();
        std::fs::write(
            dir.join("metrics/sys_0.csv"),
            "ts_ms,load1_x100\n1000,800\n",
        )
        .unwrap();
        std::fs::write(dir.join("_run_meta.json"), "{\"run_id\": \"r1\"}").unwrap();
    }

    fn runner(engine: ScriptedEngine, enable_stage2: bool) -> ClosedLoopRunner {
        let mut config = ServerConfig::for_test();
        config.enable_stage2 = enable_stage2;
        ClosedLoopRunner::new(config, Arc::new(engine), Arc::new(FixedProbe(20_000)))
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn stage1_only_writes_full_artifact_set() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let runner = runner(ScriptedEngine::ok(FAULT_SUMMARY), false);
        let status = runner.run(&run_dir).await.unwrap();
        let LoopStatus::Completed { actions_device } = status else {
            panic!("expected completion");
        };

        let out = run_dir.join("_server_out");
        for name in [
            "prompt_material.json",
            "llm_input.jsonl",
            "diagnosis.json",
            "actions.json",
            "notes.json",
            "diagnosis_v2.json",
            "actions_v2.json",
            "notes_v2.json",
            "raw_model_output.txt",
            "infer_ec.txt",
        ] {
            assert!(out.join(name).exists(), "missing {name}");
        }
        assert!(!out.join(".infer_lock").exists());

        let diag = read_json(&out.join("diagnosis.json"));
        assert_eq!(diag["fault_state"], "fault");
        assert_eq!(diag["family"], "cpu");
        // disabled-by-config skip carries no GPU risk flag
        assert!(diag.get("risk_flags").is_none());

        let notes_v2 = read_json(&out.join("notes_v2.json"));
        assert_eq!(notes_v2["summary"], "stage2_skipped: disabled_by_config");

        let script = std::fs::read_to_string(actions_device).unwrap();
        assert!(script.contains("dmesg | tail -n 200"));
        assert_eq!(script.lines().count(), 5);
        assert_eq!(
            std::fs::read_to_string(out.join("infer_ec.txt")).unwrap(),
            "0\n"
        );
    }

    #[tokio::test]
    async fn generic_failure_degrades_to_fallback() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let runner = runner(ScriptedEngine::failing("tokenizer exploded"), false);
        runner.run(&run_dir).await.unwrap();

        let out = run_dir.join("_server_out");
        let diag = read_json(&out.join("diagnosis_v2.json"));
        assert_eq!(diag["fault_state"], "unknown");
        assert!(diag["risk_flags"]
            .as_array()
            .unwrap()
            .contains(&Value::String(FLAG_INFERENCE_FAILED.into())));
        assert_eq!(diag["ok"], Value::Bool(false));
        assert!(out.join("infer_error.txt").exists());

        // fallback still ships the collection script
        let actions = read_json(&out.join("actions.json"));
        assert_eq!(actions["actions"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn oom_failure_flags_gpu_fallback() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let runner = runner(ScriptedEngine::failing("CUDA out of memory"), false);
        runner.run(&run_dir).await.unwrap();

        let diag = read_json(&run_dir.join("_server_out/diagnosis_v2.json"));
        assert!(diag["risk_flags"]
            .as_array()
            .unwrap()
            .contains(&Value::String(FLAG_GPU_FALLBACK.into())));
    }

    #[tokio::test]
    async fn stage2_rewrites_provenance_and_summary() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let engine = ScriptedEngine::ok(FAULT_SUMMARY).with_stage2(FAULT_SUMMARY);
        let runner = runner(engine, true);
        runner.run(&run_dir).await.unwrap();

        let out = run_dir.join("_server_out");
        let actions_v2 = read_json(&out.join("actions_v2.json"));
        for action in actions_v2["actions"].as_array().unwrap() {
            assert_eq!(action["why"], WHY_STAGE2_COLLECT);
        }
        let notes_v2 = read_json(&out.join("notes_v2.json"));
        assert_eq!(notes_v2["summary"], "stage2_ok: fault/cpu/unknown");

        let raw = std::fs::read_to_string(out.join("raw_model_output.txt")).unwrap();
        assert!(raw.contains("### stage1_analysis"));
        assert!(raw.contains("### stage2_summary"));
    }

    #[tokio::test]
    async fn stage2_normal_forces_normal_severity() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let stage2 = "1. fault_state: normal\nseverity: high\n4. confidence: 0.9";
        let engine = ScriptedEngine::ok(FAULT_SUMMARY).with_stage2(stage2);
        let runner = runner(engine, true);
        runner.run(&run_dir).await.unwrap();

        let diag = read_json(&run_dir.join("_server_out/diagnosis_v2.json"));
        assert_eq!(diag["fault_state"], "normal");
        assert_eq!(diag["severity"], "normal");
    }

    #[tokio::test]
    async fn low_vram_skip_inherits_stage1_with_flag() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);

        let mut config = ServerConfig::for_test();
        config.enable_stage2 = true;
        // stage-1 threshold satisfied, stage-2 headroom not
        config.min_free_mib = 1_000;
        config.min_free_mib_stage2 = 8_000;
        let runner = ClosedLoopRunner::new(
            config,
            Arc::new(ScriptedEngine::ok(FAULT_SUMMARY)),
            Arc::new(FixedProbe(2_000)),
        );
        runner.run(&run_dir).await.unwrap();

        let out = run_dir.join("_server_out");
        let diag_v2 = read_json(&out.join("diagnosis_v2.json"));
        assert!(diag_v2["risk_flags"]
            .as_array()
            .unwrap()
            .contains(&Value::String(FLAG_GPU_FALLBACK.into())));
        let notes_v2 = read_json(&out.join("notes_v2.json"));
        assert_eq!(notes_v2["summary"], "stage2_skipped: low_vram_fallback");

        // stage-1 diagnosis itself is unflagged
        let diag_v1 = read_json(&out.join("diagnosis_v2.json"));
        assert_eq!(diag_v1["fault_state"], "fault");
    }

    #[tokio::test]
    async fn held_lock_skips_without_touching_output() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);
        let out_dir = run_dir.join("_server_out");
        std::fs::create_dir_all(&out_dir).unwrap();
        std::fs::write(out_dir.join(".infer_lock"), "held\n").unwrap();

        let runner = runner(ScriptedEngine::ok(FAULT_SUMMARY), false);
        let status = runner.run(&run_dir).await.unwrap();
        assert_eq!(status, LoopStatus::SkippedLocked);
        assert!(!out_dir.join("diagnosis.json").exists());
        // lock is left in place for its owner
        assert!(out_dir.join(".infer_lock").exists());
    }

    #[tokio::test]
    async fn diagnosis_carries_enrichment() {
        let tmp = TempDir::new().unwrap();
        let run_dir = tmp.path().join("r1");
        seed_run(&run_dir);
        std::fs::create_dir_all(run_dir.join("procs")).unwrap();
        std::fs::write(run_dir.join("procs/procs_0.txt"), "42 1 R 512 busyproc\n").unwrap();

        let runner = runner(ScriptedEngine::ok(FAULT_SUMMARY), false);
        runner.run(&run_dir).await.unwrap();

        let diag: Diagnosis = serde_json::from_str(
            &std::fs::read_to_string(run_dir.join("_server_out/diagnosis_v2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(diag.fault_state, FaultState::Fault);
        assert_eq!(diag.family, FaultFamily::Cpu);
        assert!(!diag.narrative.is_empty());
        assert!(diag.clk_tck.is_some());
        assert_eq!(diag.primary_suspect.as_ref().unwrap().pid, 42);
        // pid 42 lacks pidstat coverage; the gap must be recorded
        assert!(diag.suspects.iter().any(|s| !s.evidence_ok));
    }
}
