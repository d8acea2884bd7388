//! Bundle Ingestor
//!
//! Unpacks an uploaded archive into a run directory under the runs root.
//! Extraction happens in a private staging area first; required artifacts
//! are validated there, so a partially valid run directory never becomes
//! visible. The final placement is a single rename and an existing run
//! directory is never overwritten.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::fsio::atomic_write_json;
use crate::types::{value_as_int, RunMeta};

/// Ingestion errors. The watcher maps `RunExists` to a benign duplicate
/// skip; everything else marks the item failed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("bundle not found: {0}")]
    BundleNotFound(PathBuf),

    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),

    #[error("missing required files: {0}")]
    MissingArtifacts(String),

    #[error("unable to determine run_id")]
    NoRunId,

    #[error("run_dir exists: {0}")]
    RunExists(PathBuf),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Required artifact globs; a bundle without all three is rejected.
const REQUIRED_ARTIFACTS: &[(&str, &str, &str)] = &[
    ("metrics", "sys_", ".csv"),
    ("events", "events_", ".jsonl"),
    ("procs", "procs_", ".txt"),
];

/// Ingest a bundle archive, returning the finalized run directory.
///
/// This is the sole surface the scheduler depends on.
pub fn ingest_bundle(bundle_path: &Path, runs_root: &Path) -> Result<PathBuf, IngestError> {
    if !bundle_path.exists() {
        return Err(IngestError::BundleNotFound(bundle_path.to_path_buf()));
    }
    std::fs::create_dir_all(runs_root)?;

    // staging inside runs_root keeps the final placement a same-fs rename
    let staging = tempfile::Builder::new()
        .prefix(".ingest_")
        .tempdir_in(runs_root)?;
    extract_archive(bundle_path, staging.path(), TraversalPolicy::Fail)?;

    let root_dir = find_root_dir(staging.path())?;
    let manifest = load_manifest(&root_dir);

    let run_id = resolve_run_id(bundle_path, staging.path(), &root_dir, &manifest)
        .ok_or(IngestError::NoRunId)?;

    // validate before placement so an invalid run directory never appears
    ensure_required(&root_dir)?;

    let run_dir = runs_root.join(&run_id);
    if run_dir.exists() {
        return Err(IngestError::RunExists(run_dir));
    }

    patch_run_meta(&root_dir, &run_dir, &run_id, &manifest)?;
    std::fs::rename(&root_dir, &run_dir)?;

    info!(run_id = %run_id, run_dir = %run_dir.display(), "bundle ingested");
    Ok(run_dir)
}

/// How to treat traversal-unsafe archive members.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalPolicy {
    /// Reject the whole archive (bundle ingestion).
    Fail,
    /// Drop the member and keep going (auxiliary action-result unpacks).
    SkipEntry,
}

/// Extract a tar.gz archive under `dest`, guarding against path traversal.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    policy: TraversalPolicy,
) -> Result<(), IngestError> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    let entries = archive
        .entries()
        .map_err(|e| IngestError::Archive(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| IngestError::Archive(e.to_string()))?;
        let raw = entry
            .path()
            .map_err(|e| IngestError::Archive(e.to_string()))?
            .into_owned();

        match sanitize_member_path(&raw) {
            Some(relative) => {
                let target = dest.join(relative);
                // archives routinely omit explicit directory entries
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                entry
                    .unpack(&target)
                    .map_err(|e| IngestError::Archive(e.to_string()))?;
            }
            None => match policy {
                TraversalPolicy::Fail => {
                    return Err(IngestError::UnsafePath(raw.display().to_string()));
                }
                TraversalPolicy::SkipEntry => {
                    debug!(member = %raw.display(), "skipping unsafe archive member");
                }
            },
        }
    }
    Ok(())
}

/// Normalize a member path; `None` when absolute or containing a `..`
/// segment. Leading `./` components are dropped.
fn sanitize_member_path(path: &Path) -> Option<PathBuf> {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// The run's top level: the single nested directory if there is exactly
/// one (macOS resource-fork noise ignored), else the extraction root.
fn find_root_dir(extract_dir: &Path) -> Result<PathBuf, IngestError> {
    let mut entries: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(extract_dir)? {
        let entry = entry?;
        if entry.file_name() == "__MACOSX" {
            continue;
        }
        entries.push(entry.path());
    }
    if entries.len() == 1 && entries[0].is_dir() {
        Ok(entries[0].clone())
    } else {
        Ok(extract_dir.to_path_buf())
    }
}

/// Optional manifest record shipped inside the bundle.
fn load_manifest(root_dir: &Path) -> Map<String, Value> {
    for name in ["bundle_manifest.json", "manifest.json"] {
        let path = root_dir.join(name);
        if path.exists() {
            match std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str::<Value>(&text).ok())
            {
                Some(Value::Object(map)) => return map,
                _ => return Map::new(),
            }
        }
    }
    Map::new()
}

/// run_id precedence: manifest -> nested directory name -> archive
/// filename stripped of the bundle prefix/suffix.
fn resolve_run_id(
    bundle_path: &Path,
    extract_dir: &Path,
    root_dir: &Path,
    manifest: &Map<String, Value>,
) -> Option<String> {
    if let Some(id) = manifest.get("run_id").and_then(Value::as_str) {
        if !id.is_empty() {
            return Some(id.to_string());
        }
    }
    if root_dir != extract_dir {
        if let Some(name) = root_dir.file_name().and_then(|n| n.to_str()) {
            return Some(name.to_string());
        }
    }
    let name = bundle_path.file_name()?.to_str()?;
    let stripped = name
        .trim_start_matches("bundle_")
        .trim_end_matches(".tar.gz")
        .trim_end_matches(".tgz");
    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}

/// Fail unless all required artifact families are present.
fn ensure_required(run_dir: &Path) -> Result<(), IngestError> {
    let mut missing: Vec<String> = Vec::new();
    for (dir, prefix, suffix) in REQUIRED_ARTIFACTS {
        if !has_artifact(&run_dir.join(dir), prefix, suffix) {
            missing.push(format!("{dir}/{prefix}*{suffix}"));
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(IngestError::MissingArtifacts(missing.join(", ")))
    }
}

fn has_artifact(dir: &Path, prefix: &str, suffix: &str) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(prefix) && name.ends_with(suffix) {
                return true;
            }
        }
    }
    false
}

/// Backfill the run-metadata record once, resolving the time window by
/// precedence: host-epoch-ms -> board-ms -> manifest window -> run
/// start/end. Fields the record already carries are never overwritten.
fn patch_run_meta(
    root_dir: &Path,
    run_dir: &Path,
    run_id: &str,
    manifest: &Map<String, Value>,
) -> Result<(), IngestError> {
    let meta_path = root_dir.join("_run_meta.json");
    let mut meta: RunMeta = std::fs::read_to_string(&meta_path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    let nonzero = |v: Option<i64>| v.filter(|ms| *ms > 0);
    let manifest_int = |key: &str| manifest.get(key).and_then(value_as_int);

    let start_ms = nonzero(meta.get_int("run_window_host_epoch_ms_start"))
        .or_else(|| nonzero(meta.get_int("run_window_board_ms_start")))
        .or_else(|| nonzero(manifest_int("window_start_ms")))
        .or_else(|| nonzero(meta.get_int("run_start")));
    let end_ms = nonzero(meta.get_int("run_window_host_epoch_ms_end"))
        .or_else(|| nonzero(meta.get_int("run_window_board_ms_end")))
        .or_else(|| nonzero(manifest_int("window_end_ms")))
        .or_else(|| nonzero(meta.get_int("run_end")));

    meta.set_default("run_id", json!(run_id));
    meta.set_default(
        "scenario_tag",
        manifest
            .get("scenario_tag")
            .cloned()
            .unwrap_or_else(|| json!("demo_manual")),
    );
    meta.set_default(
        "fault_type",
        manifest
            .get("fault_type")
            .cloned()
            .unwrap_or_else(|| json!("manual")),
    );
    if let Some(start) = start_ms {
        meta.set_default("run_start", json!(start));
    }
    if let Some(end) = end_ms {
        meta.set_default("run_end", json!(end));
    }
    meta.set_default("run_window_host_epoch_ms_start", json!(start_ms.unwrap_or(0)));
    meta.set_default("run_window_host_epoch_ms_end", json!(end_ms.unwrap_or(0)));
    meta.set_default("run_window_board_ms_start", json!(start_ms.unwrap_or(0)));
    meta.set_default("run_window_board_ms_end", json!(end_ms.unwrap_or(0)));
    meta.set_default(
        "run_window_source",
        manifest
            .get("run_window_source")
            .cloned()
            .unwrap_or_else(|| json!("manual")),
    );
    meta.set("run_dir", json!(run_dir.display().to_string()));

    atomic_write_json(&meta_path, &meta).map_err(|e| IngestError::Archive(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a tar.gz in-memory from (path, contents) pairs.
    fn make_bundle(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(enc);
        for (rel, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, rel, contents.as_bytes()).unwrap();
        }
        tar.into_inner().unwrap().finish().unwrap();
        path
    }

    fn complete_files<'a>(run: &'a str) -> Vec<(String, &'a str)> {
        vec![
            (format!("{run}/metrics/sys_0.csv"), "ts_ms,load1_x100\n1,5\n"),
            (format!("{run}/events/events_0.jsonl"), "{\"ts\":1}\n"),
            (format!("{run}/procs/procs_0.txt"), "1 0 S 100 init\n"),
        ]
    }

    fn make_complete_bundle(dir: &Path, run: &str) -> PathBuf {
        let files = complete_files(run);
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), *b)).collect();
        make_bundle(dir, &format!("bundle_{run}.tar.gz"), &refs)
    }

    #[test]
    fn ingests_nested_bundle_and_patches_meta() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let bundle = make_complete_bundle(tmp.path(), "run_001");

        let run_dir = ingest_bundle(&bundle, &runs).unwrap();
        assert_eq!(run_dir, runs.join("run_001"));
        assert!(run_dir.join("metrics/sys_0.csv").exists());

        let meta: RunMeta =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("_run_meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta.run_id(), Some("run_001"));
        assert_eq!(meta.get_str("scenario_tag"), Some("demo_manual"));
        assert_eq!(meta.get_int("run_window_host_epoch_ms_start"), Some(0));
    }

    #[test]
    fn duplicate_run_is_rejected_without_clobbering() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let bundle = make_complete_bundle(tmp.path(), "run_dup");

        ingest_bundle(&bundle, &runs).unwrap();
        std::fs::write(runs.join("run_dup/sentinel.txt"), "keep me").unwrap();

        let err = ingest_bundle(&bundle, &runs).unwrap_err();
        assert!(matches!(err, IngestError::RunExists(_)));
        assert!(runs.join("run_dup/sentinel.txt").exists());
    }

    #[test]
    fn missing_artifacts_leave_no_run_dir() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let bundle = make_bundle(
            tmp.path(),
            "bundle_run_bad.tar.gz",
            &[("run_bad/metrics/sys_0.csv", "ts_ms\n")],
        );

        let err = ingest_bundle(&bundle, &runs).unwrap_err();
        assert!(matches!(err, IngestError::MissingArtifacts(_)));
        assert!(!runs.join("run_bad").exists());
    }

    #[test]
    fn traversal_member_fails_closed() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let bundle = tmp.path().join("bundle_run_trav.tar.gz");
        let file = File::create(&bundle).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut tar = tar::Builder::new(enc);
        for (rel, contents) in complete_files("run_trav") {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            tar.append_data(&mut header, rel, contents.as_bytes()).unwrap();
        }
        // the builder refuses to encode `..` names, so write the bytes raw
        let evil = b"run_trav/../../escape.txt";
        let mut header = tar::Header::new_gnu();
        header.as_gnu_mut().unwrap().name[..evil.len()].copy_from_slice(evil);
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, &b"nope"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap();

        let err = ingest_bundle(&bundle, &runs).unwrap_err();
        assert!(matches!(err, IngestError::UnsafePath(_)));
        assert!(!runs.join("run_trav").exists());
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn manifest_run_id_wins_over_directory_name() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let mut files = complete_files("nested");
        let manifest = "{\"run_id\": \"from_manifest\", \"window_start_ms\": 100, \"window_end_ms\": 200}";
        files.push(("nested/bundle_manifest.json".to_string(), manifest));
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), *b)).collect();
        let bundle = make_bundle(tmp.path(), "bundle_whatever.tar.gz", &refs);

        let run_dir = ingest_bundle(&bundle, &runs).unwrap();
        assert_eq!(run_dir, runs.join("from_manifest"));

        let meta: RunMeta =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("_run_meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta.get_int("run_window_host_epoch_ms_start"), Some(100));
        assert_eq!(meta.get_int("run_window_host_epoch_ms_end"), Some(200));
    }

    #[test]
    fn flat_bundle_uses_archive_filename() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let bundle = make_bundle(
            tmp.path(),
            "bundle_flat_run.tar.gz",
            &[
                ("metrics/sys_0.csv", "ts_ms\n"),
                ("events/events_0.jsonl", "{}\n"),
                ("procs/procs_0.txt", "1 0 S 10 init\n"),
                ("extra.txt", "x"),
            ],
        );

        let run_dir = ingest_bundle(&bundle, &runs).unwrap();
        assert_eq!(run_dir, runs.join("flat_run"));
    }

    #[test]
    fn existing_meta_fields_survive() {
        let tmp = TempDir::new().unwrap();
        let runs = tmp.path().join("runs");
        let mut files = complete_files("run_meta");
        let meta = "{\"run_id\": \"run_meta\", \"scenario_tag\": \"from_device\", \"run_window_host_epoch_ms_start\": 111, \"run_window_host_epoch_ms_end\": 222}";
        files.push(("run_meta/_run_meta.json".to_string(), meta));
        let refs: Vec<(&str, &str)> = files.iter().map(|(a, b)| (a.as_str(), *b)).collect();
        let bundle = make_bundle(tmp.path(), "bundle_run_meta.tar.gz", &refs);

        let run_dir = ingest_bundle(&bundle, &runs).unwrap();
        let parsed: RunMeta =
            serde_json::from_str(&std::fs::read_to_string(run_dir.join("_run_meta.json")).unwrap())
                .unwrap();
        assert_eq!(parsed.get_str("scenario_tag"), Some("from_device"));
        assert_eq!(parsed.get_int("run_window_host_epoch_ms_start"), Some(111));
        assert_eq!(parsed.get_int("run_window_board_ms_start"), Some(111));
    }

    #[test]
    fn sanitize_member_path_rules() {
        assert_eq!(
            sanitize_member_path(Path::new("./a/b.txt")),
            Some(PathBuf::from("a/b.txt"))
        );
        assert_eq!(sanitize_member_path(Path::new("/etc/passwd")), None);
        assert_eq!(sanitize_member_path(Path::new("a/../../b")), None);
        assert_eq!(sanitize_member_path(Path::new("./")), None);
    }

    #[test]
    fn gz_roundtrip_helper_sanity() {
        // guards the test helper itself: gzip data must decode
        let tmp = TempDir::new().unwrap();
        let bundle = make_bundle(tmp.path(), "b.tar.gz", &[("f.txt", "hello")]);
        let file = File::open(bundle).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().display().to_string());
        }
        assert_eq!(names, vec!["f.txt"]);
    }
}
