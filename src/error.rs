//! Error taxonomy (spec section 7): transport error codes, the fatal `TransportError` value
//! carried through `err_close`, and the `ConnectionError` an application observes when a
//! connection terminates.

use std::fmt;

use thiserror::Error;

use crate::frame::FrameType;
use crate::VarInt;

/// A QUIC transport error code (RFC 9000 section 20.1, extended with the TLS-alert range)
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportErrorCode {
    NoError,
    Internal,
    ConnectionRefused,
    FlowControl,
    StreamLimit,
    StreamState,
    FinalSize,
    FrameEncoding,
    TransportParameter,
    ConnectionIdLimit,
    ProtocolViolation,
    InvalidToken,
    Application,
    CryptoBufferExceeded,
    KeyUpdateError,
    AeadLimitReached,
    NoViablePath,
    /// `0x0100 ..= 0x01ff`: the low byte is a TLS alert description
    Crypto(u8),
}

impl TransportErrorCode {
    pub fn code(self) -> VarInt {
        use TransportErrorCode::*;
        let v = match self {
            NoError => 0x0,
            Internal => 0x1,
            ConnectionRefused => 0x2,
            FlowControl => 0x3,
            StreamLimit => 0x4,
            StreamState => 0x5,
            FinalSize => 0x6,
            FrameEncoding => 0x7,
            TransportParameter => 0x8,
            ConnectionIdLimit => 0x9,
            ProtocolViolation => 0xa,
            InvalidToken => 0xb,
            Application => 0xc,
            CryptoBufferExceeded => 0xd,
            KeyUpdateError => 0xe,
            AeadLimitReached => 0xf,
            NoViablePath => 0x10,
            Crypto(alert) => 0x100 | alert as u64,
        };
        VarInt::from_u64(v).expect("transport error codes fit in a VarInt")
    }

    pub fn from_code(v: u64) -> Self {
        use TransportErrorCode::*;
        match v {
            0x0 => NoError,
            0x1 => Internal,
            0x2 => ConnectionRefused,
            0x3 => FlowControl,
            0x4 => StreamLimit,
            0x5 => StreamState,
            0x6 => FinalSize,
            0x7 => FrameEncoding,
            0x8 => TransportParameter,
            0x9 => ConnectionIdLimit,
            0xa => ProtocolViolation,
            0xb => InvalidToken,
            0xc => Application,
            0xd => CryptoBufferExceeded,
            0xe => KeyUpdateError,
            0xf => AeadLimitReached,
            0x10 => NoViablePath,
            x if (0x100..=0x1ff).contains(&x) => Crypto((x & 0xff) as u8),
            _ => Internal,
        }
    }
}

impl fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TransportErrorCode::*;
        match self {
            NoError => write!(f, "no error"),
            Internal => write!(f, "internal error"),
            ConnectionRefused => write!(f, "connection refused"),
            FlowControl => write!(f, "flow control error"),
            StreamLimit => write!(f, "stream limit error"),
            StreamState => write!(f, "stream state error"),
            FinalSize => write!(f, "final size error"),
            FrameEncoding => write!(f, "frame encoding error"),
            TransportParameter => write!(f, "invalid transport parameter"),
            ConnectionIdLimit => write!(f, "too many active connection IDs"),
            ProtocolViolation => write!(f, "protocol violation"),
            InvalidToken => write!(f, "invalid token"),
            Application => write!(f, "application error"),
            CryptoBufferExceeded => write!(f, "crypto buffer exceeded"),
            KeyUpdateError => write!(f, "key update error"),
            AeadLimitReached => write!(f, "AEAD confidentiality limit reached"),
            NoViablePath => write!(f, "no viable network path"),
            Crypto(alert) => write!(f, "TLS alert {alert}"),
        }
    }
}

/// A fatal, connection-closing transport error: the first one observed wins and is latched by
/// `err_close` (spec section 7) until `CONNECTION_CLOSE` is transmitted.
#[derive(Debug, Clone)]
pub struct TransportError {
    pub code: TransportErrorCode,
    pub frame: Option<FrameType>,
    pub reason: String,
}

impl TransportError {
    pub fn new(code: TransportErrorCode, frame: Option<FrameType>, reason: impl Into<String>) -> Self {
        Self {
            code,
            frame,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for TransportError {}

/// Why a connection terminated, surfaced to the application
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("peer doesn't implement any supported version")]
    VersionMismatch,
    #[error("{0}")]
    TransportError(#[from] TransportError),
    #[error("closed by peer: {reason:?} (error {code})")]
    ConnectionClosed { code: VarInt, reason: bytes::Bytes },
    #[error("closed by peer application: {reason:?} (error {code})")]
    ApplicationClosed { code: VarInt, reason: bytes::Bytes },
    #[error("reset by peer")]
    Reset,
    #[error("timed out")]
    TimedOut,
    #[error("closed locally")]
    LocallyClosed,
}

/// Crate-wide fallible operation result
pub type Result<T> = std::result::Result<T, QuicError>;

/// Crate-wide fallible-operation error, covering everything outside of an established
/// connection's own `ConnectionError` (wire decoding, configuration, the socket/TLS seams).
/// `#[non_exhaustive]` since a caller matching on this shouldn't break when a new external-seam
/// failure mode is added.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuicError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed wire encoding: {0}")]
    Codec(&'static str),
    #[error("{0}")]
    Protocol(#[from] TransportError),
    #[error("TLS error: {0}")]
    Crypto(String),
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl From<crate::coding::UnexpectedEnd> for QuicError {
    fn from(_: crate::coding::UnexpectedEnd) -> Self {
        QuicError::Codec("unexpected end of buffer")
    }
}
