//! Error taxonomy: the RFC 7540 §7 error codes, the HPACK-internal
//! compression taxonomy, and the small public [`Error`] surfaced across the
//! engine boundary.

use thiserror::Error as ThisError;

/// RFC 7540 §7 error codes, carried on RST_STREAM and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Reason {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl Reason {
    #[must_use]
    pub fn from_wire(value: u32) -> Self {
        match value {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unrecognized codes are mapped for display purposes only; the
            // wire value itself is never rewritten when relayed.
            _ => Self::InternalError,
        }
    }

    #[must_use]
    pub fn to_wire(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::NoError => "NO_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::SettingsTimeout => "SETTINGS_TIMEOUT",
            Self::StreamClosed => "STREAM_CLOSED",
            Self::FrameSizeError => "FRAME_SIZE_ERROR",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::Cancel => "CANCEL",
            Self::CompressionError => "COMPRESSION_ERROR",
            Self::ConnectError => "CONNECT_ERROR",
            Self::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            Self::InadequateSecurity => "INADEQUATE_SECURITY",
            Self::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// HPACK-internal failure modes (RFC 7541), never leaked verbatim to callers
/// but always mapped to a connection-level `CompressionError` GOAWAY.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CompressionError {
    #[error("HPACK integer overflowed while decoding")]
    IntegerOverflow,
    #[error("invalid Huffman-encoded string")]
    InvalidHuffman,
    #[error("invalid HPACK table index {0}")]
    InvalidIndex(usize),
    #[error("decoded header block exceeds the {limit}-byte decompression budget")]
    BlockTooLarge { limit: usize },
    #[error("dynamic table size update must be the first representation in the header block")]
    SizeUpdateOutOfOrder,
    #[error("dynamic table size update exceeds the advertised maximum")]
    SizeUpdateTooLarge,
    #[error("header block ended with a truncated representation")]
    Truncated,
    #[error("decoded header name or value is not valid UTF-8")]
    InvalidUtf8,
}

/// Connection- or stream-scoped protocol failure, tagged with the RFC 7540
/// §7 reason it carries on the wire (GOAWAY for connection scope,
/// RST_STREAM for stream scope).
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("connection error: {0}")]
    Connection(Reason),
    #[error("stream error: {0}")]
    Stream(Reason),
    #[error("HPACK failure: {0}")]
    Compression(#[from] CompressionError),
}

impl ProtoError {
    /// The reason code this error maps to on the wire.
    #[must_use]
    pub fn reason(&self) -> Reason {
        match self {
            Self::Connection(r) | Self::Stream(r) => *r,
            Self::Compression(_) => Reason::CompressionError,
        }
    }
}

/// The small, stable error surface returned from `SendRequest` and
/// `Initialize`. Internal taxonomy (`ProtoError`, `CompressionError`) is
/// never leaked verbatim — it is folded into one of these four kinds.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// Peer or transport misbehavior: GOAWAY received, non-cancel
    /// RST_STREAM, I/O failure, or any connection-scoped protocol error.
    #[error("network error: {0}")]
    Network(String),
    /// A timeout specific to engine operation (SETTINGS ACK wait, etc.).
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The caller or the peer cancelled the request.
    #[error("request cancelled")]
    Cancelled,
    /// The request could not be issued at all: stream id exhaustion,
    /// MAX_CONCURRENT_STREAMS saturation, body too large, malformed request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<ProtoError> for Error {
    fn from(err: ProtoError) -> Self {
        Self::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
