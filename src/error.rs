use crate::dialog::DialogId;
use crate::transport::SipAddr;

/// Errors surfaced by the stack, from wire parsing up through the
/// user-agent facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {kind} at byte {byte_offset}")]
    ParseError { kind: String, byte_offset: usize },

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("transaction timeout")]
    Timeout,

    #[error("authentication required for realm {0}, no matching credential")]
    AuthRequired(String),

    #[error("authentication failed: second challenge with same nonce")]
    AuthFailed,

    #[error("unsupported challenge scheme/algorithm: {0}")]
    UnsupportedChallenge(String),

    #[error("dialog {0} is gone")]
    DialogGone(DialogId),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("transport layer error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("dns resolution error: {0}")]
    DnsResolutionError(String),

    #[error("{0}")]
    Error(String),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::ParseError {
            kind: e.to_string(),
            byte_offset: 0,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Error(e.to_string())
    }
}

impl From<get_if_addrs::Error> for Error {
    fn from(e: get_if_addrs::Error) -> Self {
        Error::Error(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
