//! Shared header-block framing for both protocols.

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Protocol-level errors. Any of these ends the connection with an error
/// reply and nothing persisted.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("connection closed before header terminator")]
    ConnectionClosed,

    #[error("header read timed out")]
    Timeout,

    #[error("missing required header field {0}")]
    MissingField(&'static str),

    #[error("invalid LEN value: {0}")]
    BadLength(String),

    #[error("short payload: expected {expected} bytes, got {got}")]
    ShortPayload { expected: u64, got: u64 },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parsed header block plus any bytes read past the terminator.
///
/// Overrun bytes belong to the payload that follows; the payload reader
/// must consume them first.
#[derive(Debug)]
pub struct HeaderBlock {
    fields: HashMap<String, String>,
    pub rest: Vec<u8>,
}

impl HeaderBlock {
    /// Field lookup by case-insensitive key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(&key.to_ascii_uppercase()).map(String::as_str)
    }

    /// Field lookup that errors when the key is absent.
    pub fn require(&self, key: &'static str) -> Result<&str, ProtocolError> {
        self.get(key).ok_or(ProtocolError::MissingField(key))
    }
}

/// Locate the blank-line terminator (`\n\n` or `\r\n\r\n`).
/// Returns (end of header bytes, start of payload bytes).
fn find_terminator(data: &[u8]) -> Option<(usize, usize)> {
    // \r\n\r\n first so the \n\n inside it is not matched early with a
    // stray \r left on the header
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, pos + 4));
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, pos + 2))
}

/// Read a `KEY=VALUE` header block off the stream, up to `limit` bytes.
///
/// Keys are upper-cased; malformed lines (no `=`) are ignored. The caller
/// wraps this in its read timeout.
pub async fn read_header_block<S>(stream: &mut S, limit: usize) -> Result<HeaderBlock, ProtocolError>
where
    S: AsyncReadExt + Unpin,
{
    let mut data: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    let (header_end, rest_start) = loop {
        if let Some(found) = find_terminator(&data) {
            break found;
        }
        if data.len() > limit {
            return Err(ProtocolError::HeaderTooLarge { limit });
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        data.extend_from_slice(&chunk[..n]);
    };

    if header_end > limit {
        return Err(ProtocolError::HeaderTooLarge { limit });
    }

    let mut fields = HashMap::new();
    let header_text = String::from_utf8_lossy(&data[..header_end]);
    for line in header_text.lines() {
        let line = line.trim();
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        fields.insert(key.trim().to_ascii_uppercase(), value.trim().to_string());
    }

    Ok(HeaderBlock {
        fields,
        rest: data[rest_start..].to_vec(),
    })
}

/// Read exactly `need` payload bytes, consuming `first` (header overrun)
/// before touching the stream.
pub async fn read_exact_payload<S>(
    stream: &mut S,
    need: u64,
    first: &[u8],
) -> Result<Vec<u8>, ProtocolError>
where
    S: AsyncReadExt + Unpin,
{
    let need_usize = usize::try_from(need).map_err(|_| ProtocolError::BadLength(need.to_string()))?;
    let mut buf: Vec<u8> = Vec::with_capacity(need_usize.min(1 << 20));
    buf.extend_from_slice(&first[..first.len().min(need_usize)]);

    let mut chunk = vec![0u8; 64 * 1024];
    while buf.len() < need_usize {
        let want = (need_usize - buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProtocolError::ShortPayload {
                expected: need,
                got: buf.len() as u64,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(buf)
}
