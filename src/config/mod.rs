//! Server Configuration Module
//!
//! One immutable [`ServerConfig`] built at startup from CLI flags and
//! environment variables, then passed explicitly into each component at
//! construction. There is no global config state and no hot reload; a run
//! observes exactly the configuration the process started with.

pub mod defaults;

use std::path::PathBuf;

use clap::Parser;

use crate::gpu::LowVramPolicy;

/// CLI / environment configuration surface.
///
/// Every knob carries a `FAULTLINE_*` environment alias so deployments can
/// configure the daemon without editing unit files.
#[derive(Parser, Debug, Clone)]
#[command(name = "faultline")]
#[command(about = "Closed-loop fault diagnosis server for remote device telemetry")]
#[command(version)]
pub struct ServerConfig {
    /// Bind address for both protocol servers.
    #[arg(long, env = "FAULTLINE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Upload protocol port.
    #[arg(long, env = "FAULTLINE_UPLOAD_PORT", default_value_t = defaults::UPLOAD_PORT)]
    pub upload_port: u16,

    /// Action protocol port.
    #[arg(long, env = "FAULTLINE_ACTIONS_PORT", default_value_t = defaults::ACTIONS_PORT)]
    pub actions_port: u16,

    /// Inbox root (uploaded artifacts land under `<inbox>/<device>/`).
    #[arg(long, env = "FAULTLINE_INBOX", default_value = "storage/inbox")]
    pub inbox_root: PathBuf,

    /// Published-output root (`<out>/<device>/latest_*`).
    #[arg(long, env = "FAULTLINE_OUT", default_value = "storage/out")]
    pub out_root: PathBuf,

    /// Extracted run directories root.
    #[arg(long, env = "FAULTLINE_RUNS", default_value = "storage/runs")]
    pub runs_root: PathBuf,

    /// Scheduler poll interval in seconds (floored to 1).
    #[arg(long, env = "FAULTLINE_POLL_SEC", default_value_t = defaults::POLL_SECS)]
    pub poll_secs: u64,

    /// Enable the stage-2 refinement pass.
    #[arg(long, env = "FAULTLINE_ENABLE_STAGE2", default_value_t = false)]
    pub enable_stage2: bool,

    /// Stage-1 free-VRAM threshold (MiB).
    #[arg(long, env = "FAULTLINE_MIN_FREE_MIB", default_value_t = defaults::MIN_FREE_MIB)]
    pub min_free_mib: u64,

    /// Stage-2 free-VRAM headroom threshold (MiB).
    #[arg(long, env = "FAULTLINE_MIN_FREE_MIB_STAGE2", default_value_t = defaults::MIN_FREE_MIB_STAGE2)]
    pub min_free_mib_stage2: u64,

    /// Policy when free VRAM is below threshold: skip, try, or wait.
    #[arg(long, env = "FAULTLINE_LOW_VRAM_POLICY", default_value_t = LowVramPolicy::Skip)]
    pub low_vram_policy: LowVramPolicy,

    /// Grace period before the skip policy re-checks (seconds).
    #[arg(long, env = "FAULTLINE_LOW_VRAM_WAIT_SEC", default_value_t = defaults::LOW_VRAM_WAIT_SECS)]
    pub low_vram_wait_secs: u64,

    /// Stage-1 wait-policy poll interval (seconds).
    #[arg(long, env = "FAULTLINE_WAIT_POLL_SEC", default_value_t = defaults::WAIT_POLL_SECS)]
    pub wait_poll_secs: u64,

    /// Stage-1 wait-policy timeout in seconds (0 = wait forever).
    #[arg(long, env = "FAULTLINE_WAIT_MAX_SEC", default_value_t = defaults::WAIT_MAX_SECS)]
    pub wait_max_secs: u64,

    /// Stage-2 wait-policy poll interval (seconds; defaults to the stage-1 value).
    #[arg(long, env = "FAULTLINE_STAGE2_WAIT_POLL_SEC")]
    pub stage2_wait_poll_secs: Option<u64>,

    /// Stage-2 wait-policy timeout (seconds).
    #[arg(long, env = "FAULTLINE_STAGE2_WAIT_MAX_SEC", default_value_t = defaults::STAGE2_WAIT_MAX_SECS)]
    pub stage2_wait_max_secs: u64,

    /// Stage-2 input tail cap (bytes).
    #[arg(long, env = "FAULTLINE_STAGE2_TAIL_BYTES", default_value_t = defaults::STAGE2_TAIL_BYTES)]
    pub stage2_tail_bytes: u64,

    /// Stage-2 input tail cap (lines).
    #[arg(long, env = "FAULTLINE_STAGE2_TAIL_LINES", default_value_t = defaults::STAGE2_TAIL_LINES)]
    pub stage2_tail_lines: usize,

    /// Processed-marker retention per device (count, 0 = unlimited).
    #[arg(long, env = "FAULTLINE_INBOX_KEEP_MAX", default_value_t = defaults::INBOX_KEEP_MAX)]
    pub inbox_keep_max: usize,

    /// Processed-marker retention per device (days, 0 = no age prune).
    #[arg(long, env = "FAULTLINE_INBOX_KEEP_DAYS", default_value_t = defaults::INBOX_KEEP_DAYS)]
    pub inbox_keep_days: u64,

    /// Run maintenance every N scheduler ticks (0 = never).
    #[arg(long, env = "FAULTLINE_INBOX_CLEANUP_EVERY", default_value_t = defaults::INBOX_CLEANUP_EVERY)]
    pub inbox_cleanup_every: u64,

    /// Also delete `.infer_done` markers during item cleanup.
    #[arg(long, env = "FAULTLINE_DELETE_INFER_DONE", default_value_t = false)]
    pub delete_infer_done: bool,

    /// JSONL sample file whose first system message seeds the system prompt.
    #[arg(long, env = "FAULTLINE_SYSTEM_PROMPT_JSONL")]
    pub system_prompt_jsonl: Option<PathBuf>,

    /// External inference command (receives chat messages as JSON on stdin).
    #[arg(long, env = "FAULTLINE_INFER_CMD")]
    pub infer_cmd: Option<String>,
}

impl ServerConfig {
    /// Effective stage-2 wait poll interval.
    pub fn stage2_wait_poll_secs(&self) -> u64 {
        self.stage2_wait_poll_secs.unwrap_or(self.wait_poll_secs)
    }

    /// Defaults without touching the process environment; for tests.
    pub fn for_test() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            upload_port: 0,
            actions_port: 0,
            inbox_root: PathBuf::from("storage/inbox"),
            out_root: PathBuf::from("storage/out"),
            runs_root: PathBuf::from("storage/runs"),
            poll_secs: 1,
            enable_stage2: false,
            min_free_mib: defaults::MIN_FREE_MIB,
            min_free_mib_stage2: defaults::MIN_FREE_MIB_STAGE2,
            low_vram_policy: LowVramPolicy::Skip,
            low_vram_wait_secs: 0,
            wait_poll_secs: 1,
            wait_max_secs: 1,
            stage2_wait_poll_secs: None,
            stage2_wait_max_secs: 1,
            stage2_tail_bytes: defaults::STAGE2_TAIL_BYTES,
            stage2_tail_lines: defaults::STAGE2_TAIL_LINES,
            inbox_keep_max: defaults::INBOX_KEEP_MAX,
            inbox_keep_days: defaults::INBOX_KEEP_DAYS,
            inbox_cleanup_every: defaults::INBOX_CLEANUP_EVERY,
            delete_infer_done: false,
            system_prompt_jsonl: None,
            infer_cmd: None,
        }
    }
}
