//! Envelopes, codec and length-prefix framing
//!
//! Every message on the stream is `[u16 big-endian length L][L bytes envelope]`.
//! Envelopes are encoded with bincode (fixed-width little-endian integers).

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CURRENT_PROTOCOL_VERSION, Method, ProtocolVersion};

/// Size of the length prefix
pub const HEADER_LEN: usize = 2;

/// Largest body a 2-byte length prefix can describe
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Wire-level errors
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Failed to encode message: {0}")]
    Encode(bincode::Error),

    #[error("Failed to decode message: {0}")]
    Decode(bincode::Error),

    #[error("Message body of {len} bytes exceeds the {max} byte frame limit")]
    BodyTooLarge { len: usize, max: usize },
}

pub type WireResult<T> = Result<T, WireError>;

fn codec() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_BODY_LEN as u64)
        .reject_trailing_bytes()
}

/// Serialize a message body
pub fn encode<T: Serialize>(value: &T) -> WireResult<Vec<u8>> {
    codec().serialize(value).map_err(WireError::Encode)
}

/// Deserialize a message body; trailing bytes are an error
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> WireResult<T> {
    codec().deserialize(bytes).map_err(WireError::Decode)
}

/// Prefix a body with its 2-byte big-endian length
pub fn frame(body: &[u8]) -> WireResult<Vec<u8>> {
    if body.len() > MAX_BODY_LEN {
        return Err(WireError::BodyTooLarge {
            len: body.len(),
            max: MAX_BODY_LEN,
        });
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Body length described by a header
pub fn body_len(header: [u8; HEADER_LEN]) -> usize {
    u16::from_be_bytes(header) as usize
}

/// One client request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Correlates the request with its response; chosen by the client
    pub id: u32,
    pub method_name: String,
    /// Serialized parameter message, decoded by the matched handler
    pub parameters: Vec<u8>,
    pub protocol_version: Option<u32>,
    /// Number of descriptors the client attached out-of-band
    pub side_channel_fds: u32,
}

impl Invocation {
    pub fn new(id: u32, method: Method, parameters: Vec<u8>, side_channel_fds: u32) -> Self {
        Self {
            id,
            method_name: method.name().to_string(),
            parameters,
            protocol_version: Some(CURRENT_PROTOCOL_VERSION.raw()),
            side_channel_fds,
        }
    }

    pub fn with_protocol_version(mut self, version: Option<ProtocolVersion>) -> Self {
        self.protocol_version = version.map(ProtocolVersion::raw);
        self
    }

    pub fn method(&self) -> Option<Method> {
        Method::from_name(&self.method_name)
    }

    pub fn encode(&self) -> WireResult<Vec<u8>> {
        encode(self)
    }

    /// Decode a request body. An empty body is a legal frame whose fields
    /// are all absent.
    pub fn decode(body: &[u8]) -> WireResult<Self> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        decode(body)
    }

    /// Header plus encoded body
    pub fn to_frame(&self) -> WireResult<Vec<u8>> {
        frame(&self.encode()?)
    }
}

/// Outer envelope of every response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub id: u32,
    /// Serialized result message
    pub response: Vec<u8>,
}

impl ResultEnvelope {
    pub fn new<T: Serialize>(id: u32, result: &T) -> WireResult<Self> {
        Ok(Self {
            id,
            response: encode(result)?,
        })
    }

    pub fn decode(body: &[u8]) -> WireResult<Self> {
        decode(body)
    }

    pub fn result<T: DeserializeOwned>(&self) -> WireResult<T> {
        decode(&self.response)
    }

    pub fn to_frame(&self) -> WireResult<Vec<u8>> {
        frame(&encode(self)?)
    }
}
