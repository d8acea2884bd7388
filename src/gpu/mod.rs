//! GPU-Aware Stage Controller
//!
//! Gates stage-1/stage-2 inference against available accelerator memory.
//! The accelerator is a single serialized resource: admission is controlled
//! purely by the policy here, never by a queue.
//!
//! ## Policies
//!
//! - **skip**: sleep a grace period, re-check once; if still low, mark
//!   stage-2 (not stage-1) to be skipped with reason `low_vram_fallback`
//! - **wait**: poll until free memory clears the threshold or the timeout
//!   elapses (0 = wait forever), logging at least once per minute
//! - **try**: proceed unconditionally

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

/// Accelerator memory snapshot (MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuMemInfo {
    pub free_mib: u64,
    pub used_mib: u64,
    pub total_mib: u64,
}

/// Accelerator memory query seam. The production probe shells out to
/// `nvidia-smi`; tests substitute scripted probes.
#[async_trait]
pub trait GpuMemoryProbe: Send + Sync {
    /// Query free/used/total memory, or a failure reason.
    async fn query(&self) -> Result<GpuMemInfo, String>;
}

/// Behavior when free accelerator memory is below threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LowVramPolicy {
    #[default]
    Skip,
    Try,
    Wait,
}

impl std::fmt::Display for LowVramPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LowVramPolicy::Skip => write!(f, "skip"),
            LowVramPolicy::Try => write!(f, "try"),
            LowVramPolicy::Wait => write!(f, "wait"),
        }
    }
}

// ============================================================================
// nvidia-smi probe
// ============================================================================

/// Queries accelerator memory through `nvidia-smi`.
#[derive(Debug, Default, Clone)]
pub struct NvidiaSmiProbe;

#[async_trait]
impl GpuMemoryProbe for NvidiaSmiProbe {
    async fn query(&self) -> Result<GpuMemInfo, String> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.free,memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await
            .map_err(|e| format!("nvidia-smi spawn failed: {e}"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let reason = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                format!("nvidia-smi exit={}", output.status)
            };
            return Err(reason);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or("");
        parse_smi_line(line)
    }
}

/// First line of `nvidia-smi --query-gpu` CSV output -> memory snapshot.
fn parse_smi_line(line: &str) -> Result<GpuMemInfo, String> {
    let parts: Vec<&str> = line.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return Err(format!("unexpected nvidia-smi output: {line}"));
    }
    let parse = |s: &str| -> Result<u64, String> {
        s.parse::<u64>()
            .map_err(|_| format!("unexpected nvidia-smi output: {line}"))
    };
    Ok(GpuMemInfo {
        free_mib: parse(parts[0])?,
        used_mib: parse(parts[1])?,
        total_mib: parse(parts[2])?,
    })
}

// ============================================================================
// Stage Controller
// ============================================================================

/// Per-stage gating parameters.
#[derive(Debug, Clone, Copy)]
pub struct GateParams {
    pub min_free_mib: u64,
    pub poll_secs: u64,
    /// 0 means wait forever (policy `wait` only).
    pub max_wait_secs: u64,
    /// Grace period before the `skip` policy re-checks.
    pub grace_secs: u64,
}

/// Gate decision for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Threshold satisfied (or policy permits running regardless).
    Proceed,
    /// Memory still low after the policy ran its course; the stage-2 output
    /// must inherit stage-1 with reason `low_vram_fallback`.
    SkipStage2,
}

/// Gates inference stages against accelerator memory pressure.
pub struct StageController {
    probe: Arc<dyn GpuMemoryProbe>,
    policy: LowVramPolicy,
}

impl StageController {
    pub fn new(probe: Arc<dyn GpuMemoryProbe>, policy: LowVramPolicy) -> Self {
        Self { probe, policy }
    }

    pub fn policy(&self) -> LowVramPolicy {
        self.policy
    }

    /// Log the current memory snapshot; failure to probe is not an error.
    pub async fn log_snapshot(&self) {
        match self.probe.query().await {
            Ok(info) => info!(
                free_mib = info.free_mib,
                used_mib = info.used_mib,
                total_mib = info.total_mib,
                "accelerator memory"
            ),
            Err(reason) => info!(reason = %reason, "accelerator memory query unavailable"),
        }
    }

    /// Run the configured policy against a stage threshold.
    ///
    /// `stage` is a label for logging only.
    pub async fn gate(&self, stage: &str, params: GateParams) -> GateDecision {
        let info = match self.probe.query().await {
            Ok(info) => info,
            Err(reason) => {
                // No probe, no admission control: run best-effort.
                info!(stage, reason = %reason, "memory probe unavailable; proceeding");
                return GateDecision::Proceed;
            }
        };

        if info.free_mib >= params.min_free_mib {
            return GateDecision::Proceed;
        }

        warn!(
            stage,
            free_mib = info.free_mib,
            need_mib = params.min_free_mib,
            policy = %self.policy,
            "low accelerator memory"
        );

        match self.policy {
            LowVramPolicy::Try => GateDecision::Proceed,
            LowVramPolicy::Skip => {
                info!(stage, grace_secs = params.grace_secs, "grace sleep before re-check");
                tokio::time::sleep(Duration::from_secs(params.grace_secs)).await;
                match self.probe.query().await {
                    Ok(retry) if retry.free_mib >= params.min_free_mib => {
                        info!(stage, free_mib = retry.free_mib, "memory recovered after grace");
                        GateDecision::Proceed
                    }
                    Ok(retry) => {
                        warn!(
                            stage,
                            free_mib = retry.free_mib,
                            need_mib = params.min_free_mib,
                            "still low after grace; stage-2 will be skipped"
                        );
                        GateDecision::SkipStage2
                    }
                    Err(reason) => {
                        warn!(stage, reason = %reason, "re-check failed; stage-2 will be skipped");
                        GateDecision::SkipStage2
                    }
                }
            }
            LowVramPolicy::Wait => {
                if self.wait_for_free(stage, params).await {
                    GateDecision::Proceed
                } else {
                    GateDecision::SkipStage2
                }
            }
        }
    }

    /// Poll until free memory clears the threshold.
    ///
    /// Returns false on timeout or if the probe becomes unavailable. Emits a
    /// status line at least once per minute of waiting.
    async fn wait_for_free(&self, stage: &str, params: GateParams) -> bool {
        let start = Instant::now();
        let mut last_minute_logged: u64 = 0;
        loop {
            let waited = start.elapsed().as_secs();
            match self.probe.query().await {
                Err(reason) => {
                    warn!(stage, reason = %reason, waited_secs = waited, "probe unavailable; abort wait");
                    return false;
                }
                Ok(info) if info.free_mib >= params.min_free_mib => {
                    info!(
                        stage,
                        free_mib = info.free_mib,
                        need_mib = params.min_free_mib,
                        waited_secs = waited,
                        "memory ready"
                    );
                    return true;
                }
                Ok(info) => {
                    let minute = waited / 60;
                    if minute > last_minute_logged {
                        last_minute_logged = minute;
                        info!(
                            stage,
                            free_mib = info.free_mib,
                            used_mib = info.used_mib,
                            total_mib = info.total_mib,
                            need_mib = params.min_free_mib,
                            waited_secs = waited,
                            "waiting for accelerator memory"
                        );
                    }
                    if params.max_wait_secs > 0 && waited >= params.max_wait_secs {
                        warn!(
                            stage,
                            free_mib = info.free_mib,
                            need_mib = params.min_free_mib,
                            waited_secs = waited,
                            "wait timeout"
                        );
                        return false;
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs(params.poll_secs.max(1))).await;
        }
    }
}
