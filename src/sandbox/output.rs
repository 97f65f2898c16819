//! Bounded capture of a candidate's stdout/stderr.
//!
//! The first `limit` bytes are kept exactly; anything beyond is counted but
//! dropped, and the result is flagged as truncated. Readers keep draining past
//! the limit so the child never stalls on a full pipe.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Captured output of one stream, possibly truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    pub text: String,
    /// True when the stream produced more than the byte ceiling.
    pub truncated: bool,
    /// Bytes the stream actually produced, including the dropped tail.
    pub total_bytes: u64,
}

impl CapturedOutput {
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            total_bytes: text.len() as u64,
            text,
            truncated: false,
        }
    }
}

/// Accumulates at most `limit` bytes.
#[derive(Debug)]
pub struct BoundedOutput {
    buf: Vec<u8>,
    limit: usize,
    total: u64,
}

impl BoundedOutput {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8 * 1024)),
            limit,
            total: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..keep]);
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.limit as u64
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            text: decode_prefix(&self.buf),
            truncated: self.is_truncated(),
            total_bytes: self.total,
        }
    }

    pub fn finish(self) -> CapturedOutput {
        self.snapshot()
    }
}

/// Decodes captured bytes. A multi-byte character cut by the ceiling is dropped
/// instead of being replaced, so a valid UTF-8 prefix stays byte-exact.
fn decode_prefix(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Shared sink that a background reader fills while the owner may snapshot it
/// at any time, e.g. after killing a process whose pipes stay open.
pub type SharedOutput = Arc<Mutex<BoundedOutput>>;

pub fn shared(limit: usize) -> SharedOutput {
    Arc::new(Mutex::new(BoundedOutput::new(limit)))
}

/// Reads `reader` to EOF into `sink`.
pub async fn drain_into<R>(mut reader: R, sink: SharedOutput) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.lock().push(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_everything_under_the_limit() {
        let mut out = BoundedOutput::new(16);
        out.push(b"hello ");
        out.push(b"world");
        let captured = out.finish();
        assert_eq!(captured.text, "hello world");
        assert!(!captured.truncated);
        assert_eq!(captured.total_bytes, 11);
    }

    #[test]
    fn exactly_at_limit_is_not_truncated() {
        let mut out = BoundedOutput::new(4);
        out.push(b"abcd");
        assert!(!out.is_truncated());
        assert_eq!(out.finish().text, "abcd");
    }

    #[test]
    fn preserves_first_bytes_and_flags_truncation() {
        let mut out = BoundedOutput::new(10);
        out.push(b"0123456");
        out.push(b"789abcdef");
        out.push(b"ghij");
        let captured = out.finish();
        assert_eq!(captured.text, "0123456789");
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 20);
    }

    #[test]
    fn split_multibyte_character_is_dropped_not_replaced() {
        let mut out = BoundedOutput::new(4);
        // "aé" is 3 bytes, "€" is 3 bytes; the ceiling cuts the euro sign.
        out.push("aé€".as_bytes());
        let captured = out.finish();
        assert_eq!(captured.text, "aé");
        assert!(captured.truncated);
    }

    #[tokio::test]
    async fn drain_reads_past_the_limit() {
        let data = vec![b'x'; 100_000];
        let sink = shared(1024);
        drain_into(&data[..], sink.clone()).await.unwrap();
        let captured = sink.lock().snapshot();
        assert_eq!(captured.text.len(), 1024);
        assert!(captured.text.bytes().all(|b| b == b'x'));
        assert!(captured.truncated);
        assert_eq!(captured.total_bytes, 100_000);
    }
}
