//! Filesystem primitives shared across the pipeline.
//!
//! Every published artifact goes through temp-file-then-atomic-rename so a
//! reader never observes a partial write. The per-run inference lock uses an
//! O_EXCL-equivalent create because the exclusion invariant spans separate
//! process invocations, not just tasks in this one.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Sanitize an identifier to the safe token alphabet (alnum, `_`, `-`, `.`).
/// An empty result collapses to the literal `unknown`.
pub fn sanitize_token(value: &str) -> String {
    let out: String = value
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if out.is_empty() {
        "unknown".to_string()
    } else {
        out
    }
}

/// Write bytes via temp-file-then-atomic-rename, creating parent dirs.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create parent dir for {}", path.display()))?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, data).with_context(|| format!("write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

/// Atomic write of a JSON artifact (pretty-printed).
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    atomic_write(path, &data)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Sibling path with an extra suffix appended to the full filename
/// (`a/b.tar.gz` + `.done` -> `a/b.tar.gz.done`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Byte-capped truncation that never splits a UTF-8 sequence.
pub fn truncate_bytes(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Remove a file, ignoring "not found" and permission noise.
pub fn unlink_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unlink failed");
        }
    }
}

/// Read a text file, returning an empty string on any failure.
pub fn read_text_or_empty(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Last `max_lines` lines of a text file, joined with their line endings
/// stripped. Missing file reads as empty.
pub fn read_lines_tail(path: &Path, max_lines: usize) -> Vec<String> {
    let Ok(text) = fs::read_to_string(path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].iter().map(|s| s.to_string()).collect()
}

/// Tail of a file bounded first by bytes, then by lines. Used to cap
/// stage-2 prompt inputs. Invalid UTF-8 is replaced, never fatal.
pub fn read_text_tail_bytes(path: &Path, max_bytes: u64, max_lines: usize) -> String {
    let Ok(mut file) = fs::File::open(path) else {
        return String::new();
    };
    let size = match file.seek(SeekFrom::End(0)) {
        Ok(s) => s,
        Err(_) => return String::new(),
    };
    let offset = size.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(offset)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    let text = String::from_utf8_lossy(&buf);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Try to acquire the per-run inference lock.
///
/// Returns the lock path on success, `None` when another invocation owns it.
/// Any other I/O failure is also treated as contention: refusing to run is
/// always safe, clobbering a concurrent run is not.
pub fn try_acquire_lock(out_dir: &Path) -> Option<PathBuf> {
    let lock = out_dir.join(".infer_lock");
    if fs::create_dir_all(out_dir).is_err() {
        return None;
    }
    match OpenOptions::new().write(true).create_new(true).open(&lock) {
        Ok(mut file) => {
            let stamp = format!("{}\n", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
            let _ = file.write_all(stamp.as_bytes());
            Some(lock)
        }
        Err(_) => None,
    }
}

/// Release a lock previously returned by [`try_acquire_lock`].
pub fn release_lock(lock: &Path) {
    unlink_if_exists(lock);
}

/// UTC timestamp in the marker format (`2026-01-02T03:04:05Z`).
pub fn now_utc() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_token_filters_and_defaults() {
        assert_eq!(sanitize_token("dev-01.board_A"), "dev-01.board_A");
        assert_eq!(sanitize_token("  ../../etc/passwd  "), "....etcpasswd");
        assert_eq!(sanitize_token("!!!"), "unknown");
        assert_eq!(sanitize_token(""), "unknown");
    }

    #[test]
    fn atomic_write_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/out.txt");
        atomic_write(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        assert!(!with_suffix(&path, ".tmp").exists());
    }

    #[test]
    fn lock_is_exclusive_until_released() {
        let dir = TempDir::new().unwrap();
        let lock = try_acquire_lock(dir.path()).unwrap();
        assert!(try_acquire_lock(dir.path()).is_none());
        release_lock(&lock);
        assert!(try_acquire_lock(dir.path()).is_some());
    }

    #[test]
    fn tail_bytes_bounds_both_dimensions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.txt");
        let body: String = (0..100).map(|i| format!("line{}\n", i)).collect();
        fs::write(&path, &body).unwrap();

        let tail = read_text_tail_bytes(&path, 1 << 20, 3);
        assert_eq!(tail, "line97\nline98\nline99");

        // byte cap keeps only the trailing chunk
        let tail = read_text_tail_bytes(&path, 14, 100);
        assert!(tail.ends_with("line99"));
        assert!(tail.len() <= 14);
    }

    #[test]
    fn read_lines_tail_missing_file() {
        assert!(read_lines_tail(Path::new("/nonexistent/zzz"), 10).is_empty());
    }

    #[test]
    fn byte_truncation_respects_char_boundaries() {
        assert_eq!(truncate_bytes("abcdef", 4), "abcd");
        assert_eq!(truncate_bytes("ab", 4), "ab");
        // multi-byte char straddling the cap is dropped whole
        let s = "ab\u{00e9}cd";
        assert_eq!(truncate_bytes(s, 3), "ab");
    }
}
