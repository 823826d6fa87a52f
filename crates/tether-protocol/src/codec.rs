//! Codec trait and the JSON implementation.
//!
//! Frames and the messages nested inside them go through a [`Codec`]. The
//! rest of the stack never touches `serde_json` directly, so a binary codec
//! can be swapped in later.

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON. Human-readable, handy for debugging.
///
/// ```rust
/// use tether_protocol::{Codec, Frame, JsonCodec};
///
/// let codec = JsonCodec;
/// let bytes = codec.encode(&Frame::StreamOpen).unwrap();
/// assert_eq!(bytes, br#"{"type":"StreamOpen"}"#);
/// let back: Frame = codec.decode(&bytes).unwrap();
/// assert_eq!(back, Frame::StreamOpen);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}
