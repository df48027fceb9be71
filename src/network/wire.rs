//! Newline-delimited JSON framing for peer connections.
//!
//! Frame format: one JSON object per line, no length prefix. JSON string
//! escaping guarantees an encoded envelope never contains a raw newline.
//! Maximum frame size: 4MB by default (longer lines are treated as corruption).

use crate::error::WireError;
use crate::network::message::Envelope;
use serde_json::error::Category;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Default maximum frame length in bytes (4MB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// A pre-serialized envelope including its trailing newline, shared across peers.
pub type Frame = Arc<str>;

/// Serialize an envelope once so it can be fanned out to any number of peers.
pub fn encode(envelope: &Envelope) -> Result<Frame, WireError> {
    let mut json =
        serde_json::to_string(envelope).map_err(|e| WireError::Encode(e.to_string()))?;
    json.push('\n');
    Ok(Arc::from(json))
}

/// Decode one line into an envelope.
///
/// Returns `Ok(None)` for blank lines. Lines that are not JSON at all are
/// [`WireError::Corrupt`]; well-formed JSON that is not a known envelope (unknown
/// `Type`, missing or mistyped fields) is [`WireError::Unrecognized`].
pub fn decode(line: &str) -> Result<Option<Envelope>, WireError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => Ok(Some(envelope)),
        Err(e) => match e.classify() {
            Category::Data => Err(WireError::Unrecognized(e.to_string())),
            Category::Syntax | Category::Eof | Category::Io => {
                Err(WireError::Corrupt(e.to_string()))
            }
        },
    }
}

/// Wrap a read half in a line framer with a frame size limit.
pub fn frame_reader<R: AsyncRead>(reader: R, max_frame_bytes: usize) -> FramedRead<R, LinesCodec> {
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_frame_bytes))
}

/// Every codec failure ends the stream: either the peer sent an oversized or
/// non-UTF-8 line, or the socket itself failed.
pub fn classify_codec_error(err: LinesCodecError) -> WireError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            WireError::Corrupt("frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) => WireError::Corrupt(e.to_string()),
    }
}
