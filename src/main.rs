//! faultline - Closed-loop fault diagnosis server
//!
//! Accepts telemetry bundles from remote devices over TCP, runs the
//! two-stage diagnosis pipeline on each run, and publishes a per-device
//! action script that devices poll back over the action protocol.
//!
//! # Usage
//!
//! ```bash
//! # Minimal: external inference command, defaults elsewhere
//! faultline --infer-cmd './llm_infer.sh'
//!
//! # Custom storage layout and ports
//! faultline --infer-cmd './llm_infer.sh' \
//!     --inbox-root /data/inbox --runs-root /data/runs --out-root /data/out \
//!     --upload-port 18080 --actions-port 18081
//! ```
//!
//! Every flag also reads from a `FAULTLINE_*` environment variable; see
//! `faultline --help`. Logging level comes from `RUST_LOG` (default: info).

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use faultline::closed_loop::ClosedLoopRunner;
use faultline::config::ServerConfig;
use faultline::gpu::NvidiaSmiProbe;
use faultline::infer::CommandEngine;
use faultline::protocol::{ActionsServer, UploadServer};
use faultline::watcher::InboxWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskName {
    UploadServer,
    ActionsServer,
    InboxWatcher,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::UploadServer => write!(f, "UploadServer"),
            TaskName::ActionsServer => write!(f, "ActionsServer"),
            TaskName::InboxWatcher => write!(f, "InboxWatcher"),
        }
    }
}

/// Monitor tasks; the first failure cancels everything.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("supervisor: all tasks spawned, monitoring");
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("supervisor: shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!(task = %task_name, "supervisor: task completed");
                    }
                    Some(Ok(Err(e))) => {
                        error!(error = %e, "supervisor: task failed");
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "supervisor: task panicked");
                        cancel_token.cancel();
                        return Err(anyhow!("task panicked: {e}"));
                    }
                    None => {
                        info!("supervisor: all tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // drain remaining tasks so shutdown is orderly
    while task_set.join_next().await.is_some() {}
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::parse();

    let infer_cmd = config
        .infer_cmd
        .clone()
        .ok_or_else(|| anyhow!("--infer-cmd (or FAULTLINE_INFER_CMD) is required"))?;

    std::fs::create_dir_all(&config.inbox_root)
        .with_context(|| format!("create {}", config.inbox_root.display()))?;
    std::fs::create_dir_all(&config.out_root)
        .with_context(|| format!("create {}", config.out_root.display()))?;
    std::fs::create_dir_all(&config.runs_root)
        .with_context(|| format!("create {}", config.runs_root.display()))?;

    let upload_addr: SocketAddr = format!("{}:{}", config.host, config.upload_port)
        .parse()
        .with_context(|| format!("bad upload address {}:{}", config.host, config.upload_port))?;
    let actions_addr: SocketAddr = format!("{}:{}", config.host, config.actions_port)
        .parse()
        .with_context(|| format!("bad action address {}:{}", config.host, config.actions_port))?;

    info!(
        upload = %upload_addr,
        actions = %actions_addr,
        inbox = %config.inbox_root.display(),
        runs = %config.runs_root.display(),
        out = %config.out_root.display(),
        stage2 = config.enable_stage2,
        low_vram_policy = %config.low_vram_policy,
        "faultline starting"
    );

    let engine = Arc::new(CommandEngine::new(infer_cmd));
    let probe = Arc::new(NvidiaSmiProbe);
    let runner = Arc::new(ClosedLoopRunner::new(config.clone(), engine, probe));

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("ctrl-c received, shutting down");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    let upload = UploadServer::new(upload_addr, config.inbox_root.clone());
    let upload_cancel = cancel_token.clone();
    task_set.spawn(async move {
        upload.run(upload_cancel).await?;
        Ok(TaskName::UploadServer)
    });

    let actions = ActionsServer::new(actions_addr, config.out_root.clone());
    let actions_cancel = cancel_token.clone();
    task_set.spawn(async move {
        actions.run(actions_cancel).await?;
        Ok(TaskName::ActionsServer)
    });

    let watcher = InboxWatcher::new(config, runner);
    let watcher_cancel = cancel_token.clone();
    task_set.spawn(async move {
        watcher.run(watcher_cancel).await?;
        Ok(TaskName::InboxWatcher)
    });

    run_supervisor(&mut task_set, cancel_token).await
}
