use std::fmt;

use crate::attributes::*;
use crate::message::*;
use shared::error::*;

/// ErrorCodeAttribute represents ERROR-CODE attribute.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ErrorCodeAttribute {
    pub code: ErrorCode,
    pub reason: Vec<u8>,
}

impl fmt::Display for ErrorCodeAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = String::from_utf8_lossy(&self.reason);
        write!(f, "{}: {}", self.code.0, reason)
    }
}

// constants for ERROR-CODE encoding.
const ERROR_CODE_CLASS_BYTE: usize = 2;
const ERROR_CODE_NUMBER_BYTE: usize = 3;
const ERROR_CODE_REASON_START: usize = 4;
const ERROR_CODE_MODULO: u16 = 100;

impl Setter for ErrorCodeAttribute {
    /// add_to adds ERROR-CODE to m.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let mut value = Vec::with_capacity(ERROR_CODE_REASON_START + self.reason.len());
        let class = (self.code.0 / ERROR_CODE_MODULO) as u8;
        let number = (self.code.0 % ERROR_CODE_MODULO) as u8;
        value.extend_from_slice(&[0, 0, class, number]);
        value.extend_from_slice(&self.reason);
        m.add(ATTR_ERROR_CODE, &value)
    }
}

impl Getter for ErrorCodeAttribute {
    /// get_from decodes ERROR-CODE from m.
    fn get_from(&mut self, m: &Message) -> Result<()> {
        let v = m.get(ATTR_ERROR_CODE)?;
        if v.len() < ERROR_CODE_REASON_START {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: ERROR_CODE_REASON_START,
                actual: v.len(),
            });
        }

        let class = (v[ERROR_CODE_CLASS_BYTE] & 0x7) as u16;
        let number = v[ERROR_CODE_NUMBER_BYTE] as u16;
        self.code = ErrorCode(class * ERROR_CODE_MODULO + number);
        self.reason = v[ERROR_CODE_REASON_START..].to_vec();
        Ok(())
    }
}

/// ErrorCode is code for ERROR-CODE attribute.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct ErrorCode(pub u16);

impl Setter for ErrorCode {
    /// add_to adds ERROR-CODE with the catalogue reason to m.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        let a = ErrorCodeAttribute {
            code: *self,
            reason: self.reason().as_bytes().to_vec(),
        };
        a.add_to(m)
    }
}

pub const CODE_BAD_REQUEST: ErrorCode = ErrorCode(400);
pub const CODE_UNAUTHORIZED: ErrorCode = ErrorCode(401);
pub const CODE_UNKNOWN_ATTRIBUTE: ErrorCode = ErrorCode(420);
pub const CODE_STALE_CREDENTIALS: ErrorCode = ErrorCode(430);
pub const CODE_INTEGRITY_CHECK_FAILURE: ErrorCode = ErrorCode(431);
pub const CODE_MISSING_USERNAME: ErrorCode = ErrorCode(432);
pub const CODE_USE_TLS: ErrorCode = ErrorCode(433);
pub const CODE_SERVER_ERROR: ErrorCode = ErrorCode(500);
pub const CODE_GLOBAL_FAILURE: ErrorCode = ErrorCode(600);

impl ErrorCode {
    /// reason returns the canonical reason phrase, empty for codes outside
    /// the catalogue.
    pub fn reason(&self) -> &'static str {
        match *self {
            CODE_BAD_REQUEST => "BAD REQUEST",
            CODE_UNAUTHORIZED => "UNAUTHORIZED",
            CODE_UNKNOWN_ATTRIBUTE => "UNKNOWN ATTRIBUTE",
            CODE_STALE_CREDENTIALS => "STALE CREDENTIALS",
            CODE_INTEGRITY_CHECK_FAILURE => "INTEGRITY CHECK FAILURE",
            CODE_MISSING_USERNAME => "MISSING USERNAME",
            CODE_USE_TLS => "USE TLS",
            CODE_SERVER_ERROR => "SERVER ERROR",
            CODE_GLOBAL_FAILURE => "GLOBAL FAILURE",
            _ => "",
        }
    }
}
