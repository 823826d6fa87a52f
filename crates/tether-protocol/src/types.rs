//! Identity types and the frame envelope that travels on the wire.
//!
//! Every transport message is exactly one [`Frame`]. Unary calls are a
//! `Request`/`Response` pair matched by `id`; the push channel is opened with
//! `StreamOpen` and then carries `StreamData` in both directions.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, OK};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Server-issued session identity of a node.
///
/// Empty until the node has been provisioned by a SignUp. Once issued it
/// never changes for that node record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    /// Wraps an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether no identity has been assigned yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<unassigned>")
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Hardware identity of a device. Chosen by the device, never by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Wraps a device identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Metadata key carrying the caller's [`ClientId`] once it is known.
pub const IDENTITY_KEY: &str = "identity";

/// Per-call metadata: a small string map attached to every request.
pub type Metadata = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Stream messages
// ---------------------------------------------------------------------------

/// Tags of the control messages carried on the push stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StreamProcedure {
    /// Agent → server: attach this stream to my session.
    Initiate = 1,
    /// Either direction: an application message.
    Message = 2,
}

impl StreamProcedure {
    /// The numeric tag sent on the wire.
    pub fn tag(self) -> u32 {
        self as u32
    }

    /// Resolves a wire tag. `None` for tags this side doesn't know.
    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(Self::Initiate),
            2 => Some(Self::Message),
            _ => None,
        }
    }
}

/// One message on the push stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// Raw procedure tag; see [`StreamProcedure`].
    pub procedure: u32,
    /// Opaque application bytes, hex on the wire.
    #[serde(with = "hex")]
    pub payload: Vec<u8>,
}

impl StreamMessage {
    /// A message with a known procedure tag.
    pub fn new(procedure: StreamProcedure, payload: Vec<u8>) -> Self {
        Self {
            procedure: procedure.tag(),
            payload,
        }
    }

    /// The stream control message that attaches a stream to a session.
    pub fn initiate() -> Self {
        Self::new(StreamProcedure::Initiate, Vec::new())
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// The envelope for everything sent over a connection.
///
/// Internally tagged, so a request looks like
/// `{"type":"Request","id":1,"procedure":"SignIn",...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Client → server unary call.
    Request {
        id: u64,
        procedure: String,
        #[serde(default)]
        metadata: Metadata,
        #[serde(with = "hex")]
        payload: Vec<u8>,
    },

    /// Server → client reply to the request with the same `id`.
    ///
    /// `code` is [`OK`] on success, otherwise an [`ErrorCode`] value and a
    /// human-readable `message`.
    Response {
        id: u64,
        code: u16,
        #[serde(default)]
        message: String,
        #[serde(with = "hex")]
        payload: Vec<u8>,
    },

    /// Client → server: start the duplex push stream on this connection.
    StreamOpen,

    /// Either direction: one message on the push stream.
    StreamData { message: StreamMessage },

    /// Server → client: a stream message was rejected.
    StreamError {
        procedure: u32,
        code: u16,
        message: String,
    },

    /// Either direction: the push stream is closed; the connection stays up.
    StreamClose,
}

impl Frame {
    /// A successful response.
    pub fn ok(id: u64, payload: Vec<u8>) -> Self {
        Self::Response {
            id,
            code: OK,
            message: String::new(),
            payload,
        }
    }

    /// A failed response.
    pub fn error(id: u64, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Response {
            id,
            code: code.as_u16(),
            message: message.into(),
            payload: Vec::new(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::StreamOpen => "StreamOpen",
            Self::StreamData { .. } => "StreamData",
            Self::StreamError { .. } => "StreamError",
            Self::StreamClose => "StreamClose",
        }
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;

    #[test]
    fn test_request_json_shape() {
        let mut metadata = Metadata::new();
        metadata.insert(IDENTITY_KEY.to_string(), "c0ffee".to_string());
        let frame = Frame::Request {
            id: 7,
            procedure: "SignIn".to_string(),
            metadata,
            payload: vec![0xab, 0xcd],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "Request",
                "id": 7,
                "procedure": "SignIn",
                "metadata": { "identity": "c0ffee" },
                "payload": "abcd",
            })
        );
    }

    #[test]
    fn test_request_without_metadata_decodes() {
        let frame: Frame = serde_json::from_str(
            r#"{"type":"Request","id":1,"procedure":"SignOut","payload":""}"#,
        )
        .unwrap();
        assert!(matches!(frame, Frame::Request { metadata, .. } if metadata.is_empty()));
    }

    #[test]
    fn test_error_response_carries_numeric_code() {
        let json = serde_json::to_value(Frame::error(3, ErrorCode::NotFound, "no node")).unwrap();
        assert_eq!(json["code"], 404);
        assert_eq!(json["message"], "no node");
    }

    #[test]
    fn test_stream_procedure_tags() {
        assert_eq!(StreamProcedure::Initiate.tag(), 1);
        assert_eq!(StreamProcedure::from_tag(2), Some(StreamProcedure::Message));
        assert_eq!(StreamProcedure::from_tag(99), None);
    }

    #[test]
    fn test_unknown_error_code_decodes_as_internal() {
        assert_eq!(ErrorCode::from(418), ErrorCode::Internal);
        assert_eq!(ErrorCode::from(409), ErrorCode::IllegalState);
    }

    #[test]
    fn test_client_id_display_marks_unassigned() {
        assert_eq!(ClientId::default().to_string(), "<unassigned>");
        assert_eq!(ClientId::new("abc").to_string(), "abc");
    }
}
