use bytes::{Buf, BufMut, BytesMut};
use memchr::memmem;
use tokio_util::codec::{Decoder, Encoder};

use tracing as log;

use crate::Error;

/// Every valid reply starts with this marker.
pub const ACK_MARKER: &[u8] = b":A";
/// Marks a rejected command. Followed by the numeric error code.
pub const NAK_MARKER: &str = ":N";
/// Replies end with CR LF.
pub const REPLY_TERMINATOR: &[u8] = b"\r\n";
/// Commands end with a single CR.
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Default bound of the receive buffer.
pub const MAX_BUFFER_LEN: usize = 4096;

/// One complete reply, from the `:A` marker up to (excluding) the CR LF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The reply text after the acknowledgement marker, trimmed.
    pub fn payload(&self) -> &str {
        let text = self.0.trim_end_matches(&['\r', '\n'][..]);
        match text.find(":A") {
            Some(idx) => text[idx + 2..].trim(),
            None => text.trim(),
        }
    }

    pub fn is_negative(&self) -> bool {
        self.0.contains(NAK_MARKER)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.0)
    }
}

/// Framing of the MS2000 ASCII protocol.
///
/// Decoding extracts the first `:A ... \r\n` span in the buffer and throws
/// away anything before it. If no complete frame is found and the buffer has
/// grown past `max_len`, the whole buffer is discarded.
#[derive(Debug, Clone)]
pub struct AsiCodec {
    max_len: usize,
}

impl AsiCodec {
    pub fn new() -> Self {
        Self::with_max_len(MAX_BUFFER_LEN)
    }

    pub fn with_max_len(max_len: usize) -> Self {
        Self { max_len }
    }
}

impl Default for AsiCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for AsiCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(start) = memmem::find(&src[..], ACK_MARKER) {
            if let Some(len) = memmem::find(&src[start..], REPLY_TERMINATOR) {
                let end = start + len;
                let frame = Frame(String::from_utf8_lossy(&src[start..end]).into_owned());
                src.advance(end + REPLY_TERMINATOR.len());
                return Ok(Some(frame));
            }
        }
        if src.len() > self.max_len {
            log::warn!(
                "discarding {} bytes of unframed input: {:?}",
                src.len(),
                String::from_utf8_lossy(&src[..src.len().min(32)])
            );
            src.clear();
        }
        Ok(None)
    }
}

impl Encoder<&str> for AsiCodec {
    type Error = Error;

    fn encode(&mut self, command: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if memchr::memchr2(b'\n', b'\r', command.as_bytes()).is_some() {
            return Err(Error::TerminatorInCommand(command.to_string()));
        }
        dst.reserve(command.len() + 1);
        dst.put_slice(command.as_bytes());
        dst.put_u8(COMMAND_TERMINATOR);
        Ok(())
    }
}
