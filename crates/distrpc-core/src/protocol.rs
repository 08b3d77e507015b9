//! Wire framing and the RequestHeader/ResponseHeader message shapes.
//!
//! The runtime leaves encoding abstract (spec §6 item 6 style: an
//! opaque Encoder/Decoder); this module supplies the one concrete
//! codec the crate actually ships with, a length/magic-framed
//! `bincode` encoding, so the rest of the crate can compile and run
//! end to end without the codec abstraction becoming load-bearing
//! anywhere else.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{CoreError, Result};

const MAGIC: u32 = 0xD1_5C_0001;
const VERSION: u8 = 1;
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4; // magic + version + payload length
const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Header sent by the client at the start of a call, and again (empty,
/// with only `end_stream_args` meaningful) for each streamed item and
/// the final CloseSend sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHeader {
    /// Object name suffix the call targets.
    pub suffix: String,
    /// Method name being invoked.
    pub method: String,
    /// Number of positional arguments that follow this header.
    pub num_pos_args: u32,
    /// Optional deadline, encoded as epoch milliseconds (0 = none).
    pub deadline_ms: u64,
    /// Set on the sentinel request that ends the argument stream.
    pub end_stream_args: bool,
    /// Opaque trace propagation payload.
    pub trace_request: Vec<u8>,
    /// Language tag of the caller.
    pub language: String,
    /// Opaque granted-blessings payload.
    pub granted_blessings: Vec<u8>,
}

impl RequestHeader {
    /// A header for the very first message of a call.
    pub fn call(suffix: impl Into<String>, method: impl Into<String>, num_pos_args: u32) -> Self {
        RequestHeader {
            suffix: suffix.into(),
            method: method.into(),
            num_pos_args,
            deadline_ms: 0,
            end_stream_args: false,
            trace_request: Vec::new(),
            language: "en".into(),
            granted_blessings: Vec::new(),
        }
    }

    /// An empty header preceding one streamed argument item.
    pub fn stream_item() -> Self {
        RequestHeader {
            suffix: String::new(),
            method: String::new(),
            num_pos_args: 0,
            deadline_ms: 0,
            end_stream_args: false,
            trace_request: Vec::new(),
            language: String::new(),
            granted_blessings: Vec::new(),
        }
    }

    /// The CloseSend sentinel header.
    pub fn end_of_stream() -> Self {
        RequestHeader {
            end_stream_args: true,
            ..RequestHeader::stream_item()
        }
    }
}

/// Header sent by the server, either empty (preceding a streamed
/// result item) or final (`end_stream_results = true`, carrying the
/// positional result count and optional error).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Error reported by the call, if any. `None` means success.
    pub error: Option<WireError>,
    /// Set on the final header of a call.
    pub end_stream_results: bool,
    /// Number of positional results that follow the final header.
    pub num_pos_results: u32,
    /// Whether the server acknowledges the client's granted blessings.
    pub ack_blessings: bool,
    /// Opaque trace response payload.
    pub trace_response: Vec<u8>,
}

impl ResponseHeader {
    /// An empty header preceding one streamed result item.
    pub fn stream_item() -> Self {
        ResponseHeader {
            error: None,
            end_stream_results: false,
            num_pos_results: 0,
            ack_blessings: false,
            trace_response: Vec::new(),
        }
    }

    /// The final header of a successful call with `num_pos_results`
    /// positional results to follow.
    pub fn finish(num_pos_results: u32) -> Self {
        ResponseHeader {
            error: None,
            end_stream_results: true,
            num_pos_results,
            ack_blessings: false,
            trace_response: Vec::new(),
        }
    }

    /// The final header of a call that failed with `err`.
    pub fn finish_error(err: WireError) -> Self {
        ResponseHeader {
            error: Some(err),
            end_stream_results: true,
            num_pos_results: 0,
            ack_blessings: false,
            trace_response: Vec::new(),
        }
    }
}

/// Serializable projection of [`CoreError`] carried across the wire.
/// Error kind names are the language-neutral names from the error
/// taxonomy, not Rust type names, so both ends agree independent of
/// implementation language.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireError {
    /// One of the taxonomy names: `BadArg`, `BadProtocol`, `BadState`,
    /// `NoExist`, `UnknownMethod`, `UnknownSuffix`, `NotTrusted`,
    /// `NoAccess`, `NoServers`, `Timeout`, `Canceled`, `Internal`.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl From<&CoreError> for WireError {
    fn from(e: &CoreError) -> Self {
        let kind = match e {
            CoreError::BadArg(_) => "BadArg",
            CoreError::BadProtocol(_) => "BadProtocol",
            CoreError::BadState(_) => "BadState",
            CoreError::NoExist(_) => "NoExist",
            CoreError::UnknownMethod { .. } => "UnknownMethod",
            CoreError::UnknownSuffix(_) => "UnknownSuffix",
            CoreError::NotTrusted(_) => "NotTrusted",
            CoreError::NoAccess(_) => "NoAccess",
            CoreError::NoServers(_) => "NoServers",
            CoreError::Timeout(_) => "Timeout",
            CoreError::Canceled(_) => "Canceled",
            CoreError::Internal(_) => "Internal",
            CoreError::Io(_) => "Internal",
        };
        WireError {
            kind: kind.to_string(),
            message: e.to_string(),
        }
    }
}

impl From<WireError> for CoreError {
    fn from(w: WireError) -> Self {
        match w.kind.as_str() {
            "BadArg" => CoreError::BadArg(w.message),
            "BadProtocol" => CoreError::BadProtocol(w.message),
            "BadState" => CoreError::BadState(w.message),
            "NoExist" => CoreError::NoExist(w.message),
            "UnknownMethod" => CoreError::UnknownMethod {
                method: w.message,
                suffix: String::new(),
            },
            "UnknownSuffix" => CoreError::UnknownSuffix(w.message),
            "NotTrusted" => CoreError::NotTrusted(w.message),
            "NoAccess" => CoreError::NoAccess(w.message),
            "NoServers" => CoreError::NoServers(w.message),
            "Timeout" => CoreError::Timeout(std::time::Duration::from_millis(0)),
            "Canceled" => CoreError::Canceled(w.message),
            _ => CoreError::Internal(w.message),
        }
    }
}

/// Encodes `value` as a length/magic-framed bincode payload.
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| CoreError::BadProtocol(format!("encode failed: {e}")))?;
    if payload.len() as u64 > MAX_PAYLOAD as u64 {
        return Err(CoreError::BadProtocol(format!(
            "payload too large: {} bytes (max {})",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.push(VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decodes a frame previously produced by [`encode_frame`] from a byte
/// slice containing exactly one frame (header + payload).
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(CoreError::BadProtocol("frame shorter than header".into()));
    }
    let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(CoreError::BadProtocol(format!(
            "bad magic: expected 0x{MAGIC:08X}, got 0x{magic:08X}"
        )));
    }
    let version = buf[4];
    if version != VERSION {
        return Err(CoreError::BadProtocol(format!(
            "version mismatch: expected {VERSION}, got {version}"
        )));
    }
    let len = u32::from_be_bytes(buf[5..9].try_into().unwrap()) as usize;
    let payload = buf
        .get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len)
        .ok_or_else(|| CoreError::BadProtocol("truncated frame payload".into()))?;
    bincode::deserialize(payload).map_err(|e| CoreError::BadProtocol(format!("decode failed: {e}")))
}

/// Reads the declared payload length out of a frame header so callers
/// doing their own stream framing know how many more bytes to read.
pub fn peek_payload_len(header: &[u8; FRAME_HEADER_SIZE]) -> Result<u32> {
    let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(CoreError::BadProtocol(format!(
            "bad magic: expected 0x{MAGIC:08X}, got 0x{magic:08X}"
        )));
    }
    Ok(u32::from_be_bytes(header[5..9].try_into().unwrap()))
}

/// Size in bytes of the fixed frame header.
pub const fn frame_header_size() -> usize {
    FRAME_HEADER_SIZE
}
