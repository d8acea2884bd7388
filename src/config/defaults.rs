//! Built-in defaults for the server configuration.
//!
//! Every value here can be overridden by a CLI flag or environment variable;
//! see [`crate::config::ServerConfig`].

/// Upload protocol listen port.
pub const UPLOAD_PORT: u16 = 18080;

/// Action protocol listen port.
pub const ACTIONS_PORT: u16 = 18081;

/// Accept backlog for both protocol listeners.
pub const ACCEPT_BACKLOG: i32 = 16;

/// Header byte ceiling for the upload protocol.
pub const UPLOAD_HEADER_LIMIT: usize = 4096;

/// Header byte ceiling for the action protocol.
pub const ACTIONS_HEADER_LIMIT: usize = 2048;

/// Maximum accepted payload length (1 GiB).
pub const MAX_PAYLOAD_BYTES: u64 = 1024 * 1024 * 1024;

/// Per-connection header read timeout (seconds).
pub const HEADER_READ_TIMEOUT_SECS: u64 = 30;

/// Scheduler poll interval (seconds).
pub const POLL_SECS: u64 = 2;

/// Stage-1 free-VRAM threshold (MiB).
pub const MIN_FREE_MIB: u64 = 8140;

/// Stage-2 headroom threshold (MiB). Deliberately smaller than stage-1:
/// the model is already resident by then.
pub const MIN_FREE_MIB_STAGE2: u64 = 4096;

/// Grace period before the `skip` policy re-checks free VRAM (seconds).
pub const LOW_VRAM_WAIT_SECS: u64 = 15;

/// Poll interval for the `wait` policy (seconds).
pub const WAIT_POLL_SECS: u64 = 15;

/// Stage-1 wait timeout (seconds). 0 means wait forever.
pub const WAIT_MAX_SECS: u64 = 0;

/// Stage-2 wait timeout (seconds).
pub const STAGE2_WAIT_MAX_SECS: u64 = 900;

/// Stage-2 input tail cap (bytes).
pub const STAGE2_TAIL_BYTES: u64 = 40_000;

/// Stage-2 input tail cap (lines).
pub const STAGE2_TAIL_LINES: usize = 1200;

/// Processed-marker retention per device (count; 0 disables the cap).
pub const INBOX_KEEP_MAX: usize = 200;

/// Processed-marker retention per device (days; 0 disables the age prune).
pub const INBOX_KEEP_DAYS: u64 = 7;

/// Run the maintenance pass every N scheduler ticks (0 disables it).
pub const INBOX_CLEANUP_EVERY: u64 = 10;

/// Cap on the candidate process list.
pub const CANDIDATE_CAP: usize = 80;

/// Cap on `latest_error.txt` reason text (bytes).
pub const MAX_ERROR_BYTES: usize = 2048;
