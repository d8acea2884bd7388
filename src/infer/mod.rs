//! Inference Engine seam.
//!
//! The neural model is an external collaborator: `reason` runs the free-form
//! analysis pass and `summarize` compacts an analysis into the structured
//! reply the synthesizer parses. Both are deterministic/greedy with a bounded
//! token budget; that contract belongs to the implementor.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One chat turn handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Inference failure, split into the two classes the fallback logic
/// distinguishes.
#[derive(Debug, Error)]
pub enum InferError {
    #[error("accelerator out of memory: {0}")]
    OutOfMemory(String),

    #[error("inference failed: {0}")]
    Failed(String),
}

impl InferError {
    /// Classify an error message: accelerator OOM vs generic failure.
    pub fn from_message(message: String) -> Self {
        if is_oom_message(&message) {
            InferError::OutOfMemory(message)
        } else {
            InferError::Failed(message)
        }
    }

    pub fn is_oom(&self) -> bool {
        matches!(self, InferError::OutOfMemory(_))
    }
}

/// Message-inspection OOM heuristic, matching accelerator runtime wording.
pub fn is_oom_message(message: &str) -> bool {
    let low = message.to_ascii_lowercase();
    low.contains("cuda out of memory") || low.contains("out of memory")
}

/// Unified trait for inference backends.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Free-form reasoning pass over a chat transcript.
    async fn reason(&self, messages: &[ChatMessage]) -> Result<String, InferError>;

    /// Compact an analysis into the structured summary reply.
    async fn summarize(&self, analysis: &str) -> Result<String, InferError>;

    /// Backend name for logging.
    fn engine_name(&self) -> &'static str;
}

// ============================================================================
// System prompt
// ============================================================================

/// Built-in system prompt; matches the evidence-only instruction the
/// fine-tuned model was trained with.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an OS fault diagnosis and self-healing assistant.\n\
Base conclusions only on provided metrics/events/procs/dmesg/applog evidence; do not use scenario tags or obs_* fields as evidence.\n";

/// Load the system prompt from the first system message of a JSONL sample
/// file, falling back to [`DEFAULT_SYSTEM_PROMPT`] on any failure.
pub fn load_system_prompt(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };
    let Ok(text) = std::fs::read_to_string(path) else {
        return DEFAULT_SYSTEM_PROMPT.to_string();
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        #[derive(Deserialize)]
        struct Sample {
            #[serde(default)]
            messages: Vec<ChatMessage>,
        }
        if let Ok(sample) = serde_json::from_str::<Sample>(line) {
            for msg in sample.messages {
                if msg.role == "system" && !msg.content.is_empty() {
                    return msg.content;
                }
            }
        }
        break; // only the first record is consulted
    }
    DEFAULT_SYSTEM_PROMPT.to_string()
}

/// Strip `<think>`/`<analysis>` tag wrappers from a model reply, keeping the
/// inner content (some models wrap the whole answer).
pub fn sanitize_reply(text: &str) -> String {
    static TAGS: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = TAGS.get_or_init(|| {
        regex::Regex::new(r"(?i)</?\s*(think|analysis)\s*>").expect("static pattern")
    });
    re.replace_all(text, "").trim().to_string()
}

// ============================================================================
// External command adapter
// ============================================================================

/// Drives a configured external inference command.
///
/// The command receives `{"mode": "reason"|"summarize", "messages": [...]}`
/// as JSON on stdin and must print the model reply on stdout. A non-zero
/// exit maps to an [`InferError`] classified from stderr.
pub struct CommandEngine {
    command: String,
}

impl CommandEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn invoke(&self, payload: serde_json::Value) -> Result<String, InferError> {
        use tokio::io::AsyncWriteExt;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| InferError::Failed(format!("spawn {}: {e}", self.command)))?;

        let input = serde_json::to_vec(&payload)
            .map_err(|e| InferError::Failed(format!("encode payload: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| InferError::Failed(format!("write payload: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| InferError::Failed(format!("wait: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InferError::from_message(format!(
                "{} exit={} stderr={}",
                self.command,
                output.status,
                crate::fsio::truncate_bytes(&stderr, 1024)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl InferenceEngine for CommandEngine {
    async fn reason(&self, messages: &[ChatMessage]) -> Result<String, InferError> {
        self.invoke(serde_json::json!({"mode": "reason", "messages": messages}))
            .await
    }

    async fn summarize(&self, analysis: &str) -> Result<String, InferError> {
        self.invoke(serde_json::json!({
            "mode": "summarize",
            "messages": [{"role": "user", "content": analysis}],
        }))
        .await
    }

    fn engine_name(&self) -> &'static str {
        "command"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_classification() {
        assert!(InferError::from_message("CUDA out of memory. Tried to allocate".into()).is_oom());
        assert!(InferError::from_message("RuntimeError: out of memory".into()).is_oom());
        assert!(!InferError::from_message("tokenizer not found".into()).is_oom());
    }

    #[test]
    fn sanitize_reply_keeps_inner_content() {
        assert_eq!(
            sanitize_reply("<think>the run is faulty</think>"),
            "the run is faulty"
        );
        assert_eq!(sanitize_reply("< THINK >x</ think >"), "x");
        assert_eq!(sanitize_reply("plain"), "plain");
    }

    #[test]
    fn system_prompt_prefers_jsonl_first_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sft.jsonl");
        std::fs::write(
            &path,
            "{\"messages\":[{\"role\":\"system\",\"content\":\"custom prompt\"},{\"role\":\"user\",\"content\":\"x\"}]}\n",
        )
        .unwrap();
        assert_eq!(load_system_prompt(Some(&path)), "custom prompt");
        assert_eq!(load_system_prompt(None), DEFAULT_SYSTEM_PROMPT);
        assert_eq!(
            load_system_prompt(Some(std::path::Path::new("/missing"))),
            DEFAULT_SYSTEM_PROMPT
        );
    }

    #[tokio::test]
    async fn failing_command_caps_multibyte_stderr_without_panicking() {
        // over 1024 bytes of stderr with a 2-byte char straddling the cap;
        // the noise is generated inside the shell so the command string the
        // error message echoes back carries none of it
        let engine = CommandEngine::new(
            "cat >/dev/null; printf 'x' >&2; printf '\\303\\251%.0s' $(seq 600) >&2; exit 3",
        );
        let err = engine.summarize("analysis").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit"));
        // 1 ascii byte + 511 whole 2-byte chars fit under the cap
        assert_eq!(msg.matches('\u{00e9}').count(), 511);
    }
}
