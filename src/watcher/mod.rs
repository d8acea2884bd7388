//! Inbox Watcher
//!
//! Polls the per-device inbox directories, drives ready bundles through the
//! closed loop, unpacks action results back into their run directories, and
//! publishes the device-facing `latest_*` files. Item state lives entirely
//! in the filesystem: a payload is ready when its `.done` marker says `ok`,
//! and processed when a `.infer_done` marker sits next to it. The watcher
//! keeps no in-memory queue and survives restarts at any point.
//!
//! Publication rules:
//! - success rewrites `latest_actions_device.txt` + `latest_run_id.txt`,
//!   sets status `llm_ok` and clears `latest_error.txt`
//! - failure publishes a one-line `echo INFER_FAILED ...` script, status
//!   `fallback`, and the error text (size-capped)
//! - a duplicate run id touches nothing

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::closed_loop::{ClosedLoopRunner, LoopStatus};
use crate::config::defaults::MAX_ERROR_BYTES;
use crate::config::ServerConfig;
use crate::diagnosis;
use crate::fsio::{
    atomic_write, now_utc, read_text_or_empty, truncate_bytes, unlink_if_exists, with_suffix,
};
use crate::ingest::{extract_archive, ingest_bundle, IngestError, TraversalPolicy};

const BUNDLE_SUFFIX: &str = "__bundle.tar.gz";
const ACTION_RESULT_SUFFIX: &str = "__action_result.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Bundle,
    ActionResult,
}

#[derive(Debug)]
struct InboxItem {
    path: PathBuf,
    run_id: String,
    kind: ItemKind,
    mtime: SystemTime,
}

/// Split `<run_id>__<kind>` payload names. Anything else is unparsable.
fn parse_item_name(name: &str) -> Option<(String, ItemKind)> {
    let (run_id, kind) = if let Some(run) = name.strip_suffix(BUNDLE_SUFFIX) {
        (run, ItemKind::Bundle)
    } else if let Some(run) = name.strip_suffix(ACTION_RESULT_SUFFIX) {
        (run, ItemKind::ActionResult)
    } else {
        return None;
    };
    if run_id.is_empty() {
        return None;
    }
    Some((run_id.to_string(), kind))
}

/// A processed marker only retires the payload it was written for. A
/// payload re-uploaded after its run was handled is newer than the
/// surviving marker and must flow through the scheduler again (where the
/// duplicate check marks and drains it).
fn marker_is_current(payload: &Path, payload_mtime: SystemTime) -> bool {
    std::fs::metadata(with_suffix(payload, ".infer_done"))
        .and_then(|m| m.modified())
        .map(|marker_mtime| marker_mtime > payload_mtime)
        .unwrap_or(false)
}

fn mtime_or_epoch(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Filesystem-state scheduler over the inbox.
pub struct InboxWatcher {
    config: ServerConfig,
    runner: Arc<ClosedLoopRunner>,
    tick_no: u64,
}

impl InboxWatcher {
    pub fn new(config: ServerConfig, runner: Arc<ClosedLoopRunner>) -> Self {
        Self {
            config,
            runner,
            tick_no: 0,
        }
    }

    /// Poll loop, until cancellation.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        std::fs::create_dir_all(&self.config.inbox_root)?;
        std::fs::create_dir_all(&self.config.out_root)?;
        std::fs::create_dir_all(&self.config.runs_root)?;
        info!(
            inbox = %self.config.inbox_root.display(),
            poll_secs = self.config.poll_secs.max(1),
            "inbox watcher started"
        );

        loop {
            self.tick().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("inbox watcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.poll_secs.max(1))) => {}
            }
        }
    }

    /// One scheduler pass over every device directory.
    pub async fn tick(&mut self) {
        self.tick_no += 1;
        let Ok(entries) = std::fs::read_dir(&self.config.inbox_root) else {
            return;
        };
        for entry in entries.flatten() {
            let device_dir = entry.path();
            if !device_dir.is_dir() {
                continue;
            }
            let device_id = entry.file_name().to_string_lossy().to_string();
            self.scan_device(&device_id, &device_dir).await;
        }

        let every = self.config.inbox_cleanup_every;
        if every > 0 && self.tick_no % every == 0 {
            self.prune_processed();
        }
    }

    async fn scan_device(&self, device_id: &str, device_dir: &Path) {
        self.prescan_bad_done(device_dir);

        let mut action_results = Vec::new();
        let mut bundles = Vec::new();
        for item in self.collect_ready(device_dir) {
            match item.kind {
                ItemKind::ActionResult => action_results.push(item),
                ItemKind::Bundle => bundles.push(item),
            }
        }

        // results for existing runs first so a bundle re-run this tick
        // sees them
        action_results.sort_by_key(|i| i.mtime);
        let mut waiting = Vec::new();
        for item in action_results {
            if !self.unpack_action_result(device_id, &item) {
                waiting.push(item);
            }
        }

        // newest bundle wins; anything older is stale by definition
        bundles.sort_by_key(|i| i.mtime);
        if let Some(newest) = bundles.pop() {
            for stale in bundles {
                info!(device = device_id, run_id = %stale.run_id, "superseded bundle skipped");
                self.mark_item(&stale, "skip_stale", device_id, Map::new());
                self.cleanup_item(&stale.path);
            }
            self.process_bundle(device_id, &newest).await;
        }

        // a run ingested above can take its pending result in the same pass
        for item in waiting {
            self.unpack_action_result(device_id, &item);
        }
    }

    /// Flag payloads whose `.done` marker is present but not `ok` before the
    /// eligibility scan; they would otherwise sit in the inbox forever.
    fn prescan_bad_done(&self, device_dir: &Path) {
        let Ok(entries) = std::fs::read_dir(device_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let done_path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(payload_name) = name.strip_suffix(".done") else {
                continue;
            };
            let done_text = read_text_or_empty(&done_path);
            if done_text.trim_start().starts_with("ok") {
                continue;
            }
            let payload = device_dir.join(payload_name);
            if marker_is_current(&payload, mtime_or_epoch(&payload)) {
                continue;
            }

            warn!(payload = %payload.display(), "rejecting item with bad done marker");
            let device_id = device_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            match parse_item_name(payload_name) {
                None => {
                    self.mark_path(&payload, "skip_bad_name", &device_id, None, Map::new());
                }
                Some((run_id, _)) => {
                    let mut extra = Map::new();
                    extra.insert(
                        "done_text".to_string(),
                        Value::String(truncate_bytes(&done_text, 200).to_string()),
                    );
                    self.mark_path(&payload, "skip_bad_bundle", &device_id, Some(&run_id), extra);
                }
            }
            self.cleanup_item(&payload);
        }
    }

    /// Items with an `ok` done marker and no processed marker yet.
    fn collect_ready(&self, device_dir: &Path) -> Vec<InboxItem> {
        let mut items = Vec::new();
        let Ok(entries) = std::fs::read_dir(device_dir) else {
            return items;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") || name.ends_with(".done") || name.ends_with(".infer_done") {
                continue;
            }
            let Some((run_id, kind)) = parse_item_name(&name) else {
                continue;
            };
            let done_text = read_text_or_empty(&with_suffix(&path, ".done"));
            if !done_text.trim_start().starts_with("ok") {
                continue;
            }
            let mtime = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if marker_is_current(&path, mtime) {
                continue;
            }
            items.push(InboxItem {
                path,
                run_id,
                kind,
                mtime,
            });
        }
        items
    }

    /// Unpack an action-result archive into its run directory. A result that
    /// arrives before its bundle stays in the inbox until the run exists;
    /// the return value says whether the item was consumed.
    fn unpack_action_result(&self, device_id: &str, item: &InboxItem) -> bool {
        let run_dir = self.config.runs_root.join(&item.run_id);
        if !run_dir.exists() {
            debug!(
                device = device_id,
                run_id = %item.run_id,
                "action result waiting for its run directory"
            );
            return false;
        }

        let dest = run_dir.join("_action_result");
        let marker = dest.join(".unpack_done");
        if !marker.exists() {
            // unsafe members are dropped, not fatal, for auxiliary payloads
            if let Err(e) = extract_archive(&item.path, &dest, TraversalPolicy::SkipEntry) {
                warn!(run_id = %item.run_id, error = %e, "action result unpack failed");
                let mut extra = Map::new();
                extra.insert(
                    "reason".to_string(),
                    Value::String(truncate_bytes(&e.to_string(), 512).to_string()),
                );
                self.mark_item(item, "error", device_id, extra);
                self.cleanup_item(&item.path);
                return true;
            }
            if let Err(e) = atomic_write(&marker, now_utc().as_bytes()) {
                warn!(run_id = %item.run_id, error = %e, "unpack marker write failed");
            }
        }

        info!(device = device_id, run_id = %item.run_id, dest = %dest.display(), "action result unpacked");
        let mut extra = Map::new();
        extra.insert(
            "out_dir".to_string(),
            Value::String(dest.display().to_string()),
        );
        self.mark_item(item, "ok_action_result_unpacked", device_id, extra);
        self.cleanup_item(&item.path);
        true
    }

    async fn process_bundle(&self, device_id: &str, item: &InboxItem) {
        let run_dir = self.config.runs_root.join(&item.run_id);
        let server_done = run_dir.join("_server_out").join(".infer_done");

        // a run that already carries a processed marker is a duplicate
        // upload; published output stays exactly as it is
        if server_done.exists() {
            info!(device = device_id, run_id = %item.run_id, "duplicate run id, skipping");
            let mut extra = Map::new();
            extra.insert(
                "reason".to_string(),
                Value::String(format!("run_dir exists: {}", run_dir.display())),
            );
            self.mark_item(item, "skip_exists_run_dir", device_id, extra);
            self.cleanup_item(&item.path);
            return;
        }

        let run_dir = if run_dir.exists() {
            // crashed mid-inference last time; re-run in place
            run_dir
        } else {
            match ingest_bundle(&item.path, &self.config.runs_root) {
                Ok(dir) => dir,
                Err(IngestError::RunExists(existing)) => {
                    let mut extra = Map::new();
                    extra.insert(
                        "reason".to_string(),
                        Value::String(
                            truncate_bytes(&format!("run_dir exists: {}", existing.display()), 512)
                                .to_string(),
                        ),
                    );
                    self.mark_item(item, "skip_exists_run_dir", device_id, extra);
                    self.cleanup_item(&item.path);
                    return;
                }
                Err(e) => {
                    self.publish_failure(device_id, item, &e.to_string());
                    return;
                }
            }
        };

        match self.runner.run(&run_dir).await {
            Ok(LoopStatus::SkippedLocked) => {
                // leave the item in place; the lock holder will finish it
                debug!(run_id = %item.run_id, "run locked elsewhere, deferring");
            }
            Ok(LoopStatus::Completed { actions_device }) => {
                self.publish_success(device_id, item, &run_dir, &actions_device);
            }
            Err(e) => {
                warn!(device = device_id, run_id = %item.run_id, error = %e, "closed loop failed");
                let _ = atomic_write(&server_done, b"error\n");
                self.publish_failure(device_id, item, &e.to_string());
            }
        }
    }

    fn publish_success(
        &self,
        device_id: &str,
        item: &InboxItem,
        run_dir: &Path,
        actions_device: &Path,
    ) {
        let mut script = std::fs::read(actions_device).unwrap_or_default();
        if script.is_empty() {
            // older runs kept the script at the run root
            script = std::fs::read(run_dir.join("actions_device.txt")).unwrap_or_default();
        }
        if script.is_empty() {
            // never publish an empty script; fall back to raw collection
            let fallback = diagnosis::collect_actions().to_device_script();
            let _ = atomic_write(actions_device, fallback.as_bytes());
            script = fallback.into_bytes();
        }

        let out_dir = self.config.out_root.join(device_id);
        if self.write_latest(&out_dir, &item.run_id, &script, "llm_ok").is_err() {
            return;
        }
        unlink_if_exists(&out_dir.join("latest_error.txt"));

        let mut extra = Map::new();
        extra.insert(
            "run_dir".to_string(),
            Value::String(run_dir.display().to_string()),
        );
        self.mark_item(item, "ok", device_id, extra);
        let _ = atomic_write(&run_dir.join("_server_out").join(".infer_done"), b"ok\n");
        self.cleanup_item(&item.path);
        info!(device = device_id, run_id = %item.run_id, "actions published");
    }

    /// Degraded publication: the device always gets something runnable plus
    /// a visible error, and the item never blocks the inbox.
    fn publish_failure(&self, device_id: &str, item: &InboxItem, reason: &str) {
        let script = format!("echo INFER_FAILED device={device_id} run={}\n", item.run_id);
        let out_dir = self.config.out_root.join(device_id);
        if self
            .write_latest(&out_dir, &item.run_id, script.as_bytes(), "fallback")
            .is_err()
        {
            return;
        }
        let _ = atomic_write(
            &out_dir.join("latest_error.txt"),
            truncate_bytes(reason, MAX_ERROR_BYTES).as_bytes(),
        );

        let mut extra = Map::new();
        extra.insert(
            "reason".to_string(),
            Value::String(truncate_bytes(reason, 1024).to_string()),
        );
        self.mark_item(item, "error", device_id, extra);
        self.cleanup_item(&item.path);
    }

    fn write_latest(
        &self,
        out_dir: &Path,
        run_id: &str,
        script: &[u8],
        status: &str,
    ) -> Result<()> {
        atomic_write(&out_dir.join("latest_actions_device.txt"), script)?;
        atomic_write(
            &out_dir.join("latest_run_id.txt"),
            format!("{run_id}\n").as_bytes(),
        )?;
        atomic_write(
            &out_dir.join("latest_infer_status.txt"),
            format!("{status}\n").as_bytes(),
        )?;
        Ok(())
    }

    fn mark_item(&self, item: &InboxItem, status: &str, device_id: &str, extra: Map<String, Value>) {
        self.mark_path(&item.path, status, device_id, Some(&item.run_id), extra);
    }

    /// Write the processed marker next to the payload: one JSON object, one
    /// trailing newline.
    fn mark_path(
        &self,
        payload: &Path,
        status: &str,
        device_id: &str,
        run_id: Option<&str>,
        extra: Map<String, Value>,
    ) {
        let mut record = Map::new();
        record.insert("ts_utc".to_string(), Value::String(now_utc()));
        record.insert("status".to_string(), Value::String(status.to_string()));
        if !device_id.is_empty() {
            record.insert(
                "device_id".to_string(),
                Value::String(device_id.to_string()),
            );
        }
        if let Some(run_id) = run_id {
            record.insert("run_id".to_string(), Value::String(run_id.to_string()));
        }
        record.extend(extra);

        let line = Value::Object(record).to_string() + "\n";
        let marker = with_suffix(payload, ".infer_done");
        if let Err(e) = atomic_write(&marker, line.as_bytes()) {
            warn!(marker = %marker.display(), error = %e, "processed marker write failed");
        }
    }

    /// Remove the payload and its readiness marker. The processed marker
    /// stays as the durable record unless configured away.
    fn cleanup_item(&self, payload: &Path) {
        unlink_if_exists(payload);
        unlink_if_exists(&with_suffix(payload, ".done"));
        if self.config.delete_infer_done {
            unlink_if_exists(&with_suffix(payload, ".infer_done"));
        }
    }

    /// Bounded retention of processed markers, newest first.
    fn prune_processed(&self) {
        let keep_max = self.config.inbox_keep_max;
        let keep_days = self.config.inbox_keep_days;
        if keep_max == 0 && keep_days == 0 {
            return;
        }
        let cutoff = (keep_days > 0)
            .then(|| SystemTime::now() - Duration::from_secs(keep_days * 86_400));

        let Ok(devices) = std::fs::read_dir(&self.config.inbox_root) else {
            return;
        };
        for device in devices.flatten() {
            let device_dir = device.path();
            if !device_dir.is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(&device_dir) else {
                continue;
            };
            let mut marks: Vec<(PathBuf, SystemTime)> = entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().ends_with(".infer_done"))
                .map(|e| {
                    let mtime = e
                        .metadata()
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    (e.path(), mtime)
                })
                .collect();
            marks.sort_by(|a, b| b.1.cmp(&a.1));

            for (idx, (marker, mtime)) in marks.iter().enumerate() {
                let too_many = keep_max > 0 && idx >= keep_max;
                let too_old = cutoff.is_some_and(|c| *mtime < c);
                if !(too_many || too_old) {
                    continue;
                }
                debug!(marker = %marker.display(), "pruning processed item");
                let marker_str = marker.to_string_lossy();
                if let Some(payload_str) = marker_str.strip_suffix(".infer_done") {
                    let payload = PathBuf::from(payload_str);
                    unlink_if_exists(&payload);
                    unlink_if_exists(&with_suffix(&payload, ".done"));
                }
                unlink_if_exists(marker);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuMemInfo, GpuMemoryProbe};
    use crate::infer::{ChatMessage, InferError, InferenceEngine};
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    struct StubEngine {
        fail: bool,
    }

    #[async_trait]
    impl InferenceEngine for StubEngine {
        async fn reason(&self, _messages: &[ChatMessage]) -> Result<String, InferError> {
            if self.fail {
                Err(InferError::from_message("model unavailable".to_string()))
            } else {
                Ok("1. fault_state: fault\nfamily: cpu\n4. confidence: 0.8".to_string())
            }
        }

        async fn summarize(&self, analysis: &str) -> Result<String, InferError> {
            Ok(analysis.to_string())
        }

        fn engine_name(&self) -> &'static str {
            "stub"
        }
    }

    struct RoomyProbe;

    #[async_trait]
    impl GpuMemoryProbe for RoomyProbe {
        async fn query(&self) -> Result<GpuMemInfo, String> {
            Ok(GpuMemInfo {
                free_mib: 20_000,
                used_mib: 0,
                total_mib: 24_000,
            })
        }
    }

    fn make_watcher(tmp: &TempDir, fail: bool) -> InboxWatcher {
        let mut config = ServerConfig::for_test();
        config.inbox_root = tmp.path().join("inbox");
        config.out_root = tmp.path().join("out");
        config.runs_root = tmp.path().join("runs");
        let runner = Arc::new(ClosedLoopRunner::new(
            config.clone(),
            Arc::new(StubEngine { fail }),
            Arc::new(RoomyProbe),
        ));
        InboxWatcher::new(config, runner)
    }

    fn make_bundle(run_id: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let files = [
            (
                format!("{run_id}/metrics/sys_0.csv"),
                "ts_ms,load1_x100\n1000,400\n".to_string(),
            ),
            (
                format!("{run_id}/events/events_0.jsonl"),
                "{\"ts\":1500,\"tag\":\"cpu_hotspot\",\"msg\":\"spike\"}\n".to_string(),
            ),
            (
                format!("{run_id}/procs/procs_0.txt"),
                "10 1 R 512 busy\n".to_string(),
            ),
        ];
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn drop_bundle(watcher: &InboxWatcher, device: &str, run_id: &str) -> PathBuf {
        let dir = watcher.config.inbox_root.join(device);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{run_id}{BUNDLE_SUFFIX}"));
        std::fs::write(&path, make_bundle(run_id)).unwrap();
        std::fs::write(with_suffix(&path, ".done"), "ok\n").unwrap();
        path
    }

    fn read_out(watcher: &InboxWatcher, device: &str, name: &str) -> String {
        std::fs::read_to_string(watcher.config.out_root.join(device).join(name))
            .unwrap_or_default()
    }

    #[test]
    fn item_name_parsing() {
        assert_eq!(
            parse_item_name("r1__bundle.tar.gz"),
            Some(("r1".to_string(), ItemKind::Bundle))
        );
        assert_eq!(
            parse_item_name("r1__action_result.tar.gz"),
            Some(("r1".to_string(), ItemKind::ActionResult))
        );
        assert_eq!(parse_item_name("__bundle.tar.gz"), None);
        assert_eq!(parse_item_name("r1__other.bin"), None);
        assert_eq!(parse_item_name("r1__bundle.tar.gz.tmp"), None);
    }

    #[tokio::test]
    async fn bundle_flows_to_published_actions() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        let payload = drop_bundle(&watcher, "dev1", "r1");

        watcher.tick().await;

        assert_eq!(read_out(&watcher, "dev1", "latest_run_id.txt"), "r1\n");
        assert_eq!(read_out(&watcher, "dev1", "latest_infer_status.txt"), "llm_ok\n");
        assert!(!read_out(&watcher, "dev1", "latest_actions_device.txt").is_empty());
        assert!(!watcher
            .config
            .out_root
            .join("dev1/latest_error.txt")
            .exists());

        // payload and readiness marker gone, processed marker durable
        assert!(!payload.exists());
        assert!(!with_suffix(&payload, ".done").exists());
        let mark = read_text_or_empty(&with_suffix(&payload, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "ok");
        assert_eq!(record["run_id"], "r1");

        let run_dir = watcher.config.runs_root.join("r1");
        assert!(run_dir.join("_server_out/diagnosis.json").exists());
        assert_eq!(
            read_text_or_empty(&run_dir.join("_server_out/.infer_done")),
            "ok\n"
        );
    }

    #[tokio::test]
    async fn duplicate_run_id_leaves_published_output_alone() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        drop_bundle(&watcher, "dev1", "r1");
        watcher.tick().await;

        // second upload of the same run, then a different latest sentinel
        let out_dir = watcher.config.out_root.join("dev1");
        let before = read_out(&watcher, "dev1", "latest_actions_device.txt");
        let payload = drop_bundle(&watcher, "dev1", "r1");
        watcher.tick().await;

        assert_eq!(read_out(&watcher, "dev1", "latest_actions_device.txt"), before);
        assert_eq!(read_out(&watcher, "dev1", "latest_run_id.txt"), "r1\n");
        assert!(!out_dir.join("latest_error.txt").exists());
        assert!(!payload.exists());
        let mark = read_text_or_empty(&with_suffix(&payload, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "skip_exists_run_dir");
    }

    #[tokio::test]
    async fn newest_bundle_wins_and_stale_is_marked() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        let old = drop_bundle(&watcher, "dev1", "r_old");
        let new = drop_bundle(&watcher, "dev1", "r_new");
        // deterministic ordering regardless of filesystem timestamp grain
        let past = std::time::SystemTime::now() - Duration::from_secs(60);
        let f = std::fs::File::options().append(true).open(&old).unwrap();
        f.set_modified(past).unwrap();

        watcher.tick().await;

        assert_eq!(read_out(&watcher, "dev1", "latest_run_id.txt"), "r_new\n");
        let mark = read_text_or_empty(&with_suffix(&old, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "skip_stale");
        assert!(!old.exists());
        assert!(!new.exists());
        assert!(!watcher.config.runs_root.join("r_old").exists());
    }

    #[tokio::test]
    async fn inference_failure_publishes_fallback() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        // corrupt archive forces an ingest failure
        let dir = watcher.config.inbox_root.join("dev1");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("r1{BUNDLE_SUFFIX}"));
        std::fs::write(&path, b"not a tar.gz").unwrap();
        std::fs::write(with_suffix(&path, ".done"), "ok\n").unwrap();

        watcher.tick().await;

        assert_eq!(read_out(&watcher, "dev1", "latest_infer_status.txt"), "fallback\n");
        assert_eq!(
            read_out(&watcher, "dev1", "latest_actions_device.txt"),
            "echo INFER_FAILED device=dev1 run=r1\n"
        );
        assert!(!read_out(&watcher, "dev1", "latest_error.txt").is_empty());
        let mark = read_text_or_empty(&with_suffix(&path, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "error");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bad_done_marker_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        let dir = watcher.config.inbox_root.join("dev1");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("r1{BUNDLE_SUFFIX}"));
        std::fs::write(&path, b"payload").unwrap();
        std::fs::write(with_suffix(&path, ".done"), "checksum mismatch\n").unwrap();

        watcher.tick().await;

        assert!(!path.exists());
        let mark = read_text_or_empty(&with_suffix(&path, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "skip_bad_bundle");
        assert_eq!(record["done_text"], "checksum mismatch\n");
        // nothing published for a rejected item
        assert!(!watcher.config.out_root.join("dev1").exists());
    }

    #[tokio::test]
    async fn unparsable_name_with_bad_done_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        let dir = watcher.config.inbox_root.join("dev1");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("garbage.tar.gz");
        std::fs::write(&path, b"payload").unwrap();
        std::fs::write(with_suffix(&path, ".done"), "err\n").unwrap();

        watcher.tick().await;

        let mark = read_text_or_empty(&with_suffix(&path, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "skip_bad_name");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn action_result_waits_for_its_run() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        let dir = watcher.config.inbox_root.join("dev1");
        std::fs::create_dir_all(&dir).unwrap();

        let result_path = dir.join(format!("r1{ACTION_RESULT_SUFFIX}"));
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let body = b"exit 0\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "actions_exec.log", &body[..])
            .unwrap();
        let bytes = builder.into_inner().unwrap().finish().unwrap();
        std::fs::write(&result_path, bytes).unwrap();
        std::fs::write(with_suffix(&result_path, ".done"), "ok\n").unwrap();

        // no run directory yet: the item must survive the tick untouched
        watcher.tick().await;
        assert!(result_path.exists());
        assert!(!with_suffix(&result_path, ".infer_done").exists());

        drop_bundle(&watcher, "dev1", "r1");
        watcher.tick().await;

        let run_dir = watcher.config.runs_root.join("r1");
        assert!(run_dir.join("_action_result/actions_exec.log").exists());
        assert!(run_dir.join("_action_result/.unpack_done").exists());
        assert!(!result_path.exists());
        let mark = read_text_or_empty(&with_suffix(&result_path, ".infer_done"));
        let record: Value = serde_json::from_str(mark.trim()).unwrap();
        assert_eq!(record["status"], "ok_action_result_unpacked");
    }

    #[tokio::test]
    async fn maintenance_prunes_beyond_keep_max() {
        let tmp = TempDir::new().unwrap();
        let mut watcher = make_watcher(&tmp, false);
        watcher.config.inbox_keep_max = 2;
        watcher.config.inbox_keep_days = 0;
        watcher.config.inbox_cleanup_every = 1;

        let dir = watcher.config.inbox_root.join("dev1");
        std::fs::create_dir_all(&dir).unwrap();
        let mut markers = Vec::new();
        for i in 0..4 {
            let payload = dir.join(format!("r{i}{BUNDLE_SUFFIX}"));
            let marker = with_suffix(&payload, ".infer_done");
            std::fs::write(&marker, "{\"status\":\"ok\"}\n").unwrap();
            let f = std::fs::File::options().append(true).open(&marker).unwrap();
            f.set_modified(SystemTime::now() - Duration::from_secs(100 - i as u64))
                .unwrap();
            markers.push(marker);
        }

        watcher.tick().await;

        // two newest survive, two oldest are pruned
        assert!(!markers[0].exists());
        assert!(!markers[1].exists());
        assert!(markers[2].exists());
        assert!(markers[3].exists());
    }

}
