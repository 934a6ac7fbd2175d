#![allow(dead_code)]

use std::io;
use std::net;
use std::num::{ParseFloatError, ParseIntError};
use std::string::FromUtf8Error;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("unexpected end of buffer: expected {expected}, actual {actual}")]
    ErrUnexpectedEndOfBuffer { expected: usize, actual: usize },
    #[error("operation would block")]
    ErrWouldBlock,
    #[error("no socket for destination")]
    ErrUnknownDestination,
    #[error("socket not found")]
    ErrSocketNotFound,
    #[error("socket is not bound")]
    ErrSocketNotBound,

    //STUN errors
    #[error("attribute not found")]
    ErrAttributeNotFound,
    #[error("attribute size is invalid")]
    ErrAttributeSizeInvalid,
    #[error("attribute size overflow")]
    ErrAttributeSizeOverflow,
    #[error("unexpected EOF: not enough bytes to read header")]
    ErrUnexpectedHeaderEof,
    #[error("unexpected bytes after the message body")]
    ErrTrailingBytes,
    #[error("message body is too large")]
    ErrMessageTooLarge,
    #[error("bad address family")]
    ErrBadAddressFamily,
    #[error("bad UNKNOWN-ATTRIBUTES size")]
    ErrBadUnknownAttrsSize,
    #[error("unknown attribute type {0:#06x}")]
    ErrUnknownAttributeType(u16),
    #[error("transaction not exists")]
    ErrTransactionNotExists,

    //ICE errors
    #[error("port not found")]
    ErrPortNotFound,
    #[error("connection not found")]
    ErrConnectionNotFound,
    #[error("connection is not connected")]
    ErrConnectionNotConnected,
    #[error("unknown protocol type")]
    ErrUnknownProtocolType,
    #[error("unknown candidate type")]
    ErrUnknownCandidateType,
    #[error("candidate is missing attribute: {0}")]
    ErrCandidateMissingAttribute(String),
    #[error("candidate has unspecified address")]
    ErrCandidateUnspecifiedAddress,
    #[error("candidate has local address")]
    ErrCandidateLocalAddress,
    #[error("candidate has restricted port")]
    ErrCandidateRestrictedPort,
    #[error("candidate username is too long")]
    ErrCandidateUsernameTooLong,
    #[error("candidate username has invalid characters")]
    ErrCandidateUsernameInvalid,

    #[error("parse ip: {0}")]
    ParseIp(#[from] net::AddrParseError),
    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("utf8: {0}")]
    Utf8(#[from] FromUtf8Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}
