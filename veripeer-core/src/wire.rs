//! Framing: payload bytes + 4-byte sentinel (`EOM\x01`). Completion is detected by sentinel scan.
//!
//! The sentinel is searched for in the whole accumulated buffer after every read, so a sentinel
//! split across two reads is still found. A payload that itself contains the sentinel is cut at
//! the rightmost occurrence; such payloads do not survive a round trip.

/// End-of-message marker appended to every frame.
pub const SENTINEL: &[u8; 4] = b"EOM\x01";

/// Upper bound on accumulated bytes before a frame is rejected.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// Default size of a single receive.
pub const RECV_CHUNK: usize = 4096;

/// Encode a message into a single frame: payload + sentinel.
pub fn encode_frame(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + SENTINEL.len());
    out.extend_from_slice(message);
    out.extend_from_slice(SENTINEL);
    out
}

/// Error decoding a frame from a stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("connection closed before end of message")]
    ConnectionClosed,
    #[error("frame too large")]
    TooLarge,
    #[error("receive failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Accumulates received bytes until a sentinel is seen.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes. Returns the complete message once the sentinel has been observed
    /// anywhere in the accumulated buffer; the decoder is reset afterwards.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        self.buf.extend_from_slice(bytes);
        if let Some(at) = rfind_sentinel(&self.buf) {
            let mut message = std::mem::take(&mut self.buf);
            message.truncate(at);
            return Ok(Some(message));
        }
        if self.buf.len() > MAX_FRAME_LEN {
            self.buf.clear();
            return Err(FrameError::TooLarge);
        }
        Ok(None)
    }

    /// Bytes buffered so far without a sentinel.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn rfind_sentinel(buf: &[u8]) -> Option<usize> {
    if buf.len() < SENTINEL.len() {
        return None;
    }
    buf.windows(SENTINEL.len()).rposition(|w| w == SENTINEL)
}

/// Drive a blocking receive primitive until one full message has arrived.
///
/// `receive` fills the given buffer and returns the number of bytes written. A zero-byte receive
/// means the peer closed the connection and fails with [`FrameError::ConnectionClosed`].
pub fn decode_stream<F>(mut receive: F) -> Result<Vec<u8>, FrameError>
where
    F: FnMut(&mut [u8]) -> std::io::Result<usize>,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; RECV_CHUNK];
    loop {
        let n = receive(&mut chunk)?;
        if n == 0 {
            return Err(FrameError::ConnectionClosed);
        }
        if let Some(message) = decoder.push(&chunk[..n])? {
            return Ok(message);
        }
    }
}
