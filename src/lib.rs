//! FAULTLINE: Closed-Loop Device Fault Diagnosis
//!
//! Server-side pipeline for automated fault diagnosis of remote device
//! telemetry bundles.
//!
//! ## Architecture
//!
//! - **Protocol Servers**: TCP upload (bundle ingest) and action retrieval
//! - **Inbox Watcher**: polling scheduler that dedups, sequences, and
//!   idempotently retries processing of uploaded artifacts
//! - **Evidence Builder**: metrics/events/process snapshots -> sanitized,
//!   ranked evidence and a formatted prompt body
//! - **Closed-Loop Runner**: GPU-gated two-stage inference producing a
//!   structured diagnosis and a device action script

pub mod config;
pub mod types;
pub mod fsio;
pub mod protocol;
pub mod ingest;
pub mod evidence;
pub mod gpu;
pub mod infer;
pub mod diagnosis;
pub mod closed_loop;
pub mod watcher;

// Re-export configuration
pub use config::ServerConfig;

// Re-export commonly used types
pub use types::{
    Action, ActionSet, CandidateProcess, Diagnosis, EvidenceItem, FaultFamily, FaultState,
    Notes, RunMeta, SuspectProcess,
};

// Re-export component entry points
pub use closed_loop::ClosedLoopRunner;
pub use gpu::{GpuMemInfo, GpuMemoryProbe, LowVramPolicy, NvidiaSmiProbe};
pub use infer::{ChatMessage, InferenceEngine};
pub use protocol::{ActionsServer, UploadServer};
pub use watcher::InboxWatcher;
