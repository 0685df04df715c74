use ethwire_rlp::error::{RLPDecodeError, RLPEncodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RLPxError {
    /// The underlying byte stream is gone (EOF, reset, or dropped writer).
    #[error("transport closed")]
    TransportClosed,
    /// Not enough buffered bytes to decode a full frame; recoverable.
    #[error("incomplete frame")]
    ShortFrame,
    #[error("frame MAC mismatch")]
    MACMismatch,
    #[error("decode error: {0}")]
    DecodeError(#[from] RLPDecodeError),
    #[error("encode error: {0}")]
    EncodeError(#[from] RLPEncodeError),
    #[error("invalid handshake message: {0}")]
    InvalidAuth(String),
    #[error("unsupported handshake version {0}")]
    UnsupportedVersion(u8),
    #[error("protocol breach: {0}")]
    ProtocolBreach(String),
    #[error("subprotocol not negotiated")]
    SubprotocolNotNegotiated,
    #[error("service not started")]
    ServiceNotStarted,
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("invalid connection state")]
    InvalidState,
    #[error("invalid peer id")]
    InvalidPeerId,
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("cryptography error: {0}")]
    CryptographyError(String),
}

impl From<k256::elliptic_curve::Error> for RLPxError {
    fn from(err: k256::elliptic_curve::Error) -> Self {
        RLPxError::CryptographyError(err.to_string())
    }
}

impl From<k256::ecdsa::Error> for RLPxError {
    fn from(err: k256::ecdsa::Error) -> Self {
        RLPxError::CryptographyError(err.to_string())
    }
}

impl From<aes::cipher::InvalidLength> for RLPxError {
    fn from(err: aes::cipher::InvalidLength) -> Self {
        RLPxError::CryptographyError(err.to_string())
    }
}

impl From<aes::cipher::StreamCipherError> for RLPxError {
    fn from(err: aes::cipher::StreamCipherError) -> Self {
        RLPxError::CryptographyError(err.to_string())
    }
}
