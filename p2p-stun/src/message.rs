use bytes::BufMut;
use rand::Rng;
use std::fmt;

use crate::attributes::*;
use shared::error::*;

/// Size of the fixed message header.
pub const MESSAGE_HEADER_SIZE: usize = 20;
/// Size of the transaction id.
pub const TRANSACTION_ID_SIZE: usize = 16;

/// Setter sets *Message attribute.
pub trait Setter {
    fn add_to(&self, m: &mut Message) -> Result<()>;
}

/// Getter parses attribute from *Message.
pub trait Getter {
    fn get_from(&mut self, m: &Message) -> Result<()>;
}

/// TransactionId is the 128-bit id of a request/response exchange.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct TransactionId(pub [u8; TRANSACTION_ID_SIZE]);

impl TransactionId {
    /// new returns a new random transaction id.
    pub fn new() -> Self {
        let mut b = TransactionId([0u8; TRANSACTION_ID_SIZE]);
        rand::rng().fill(&mut b.0);
        b
    }
}

impl Setter for TransactionId {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.transaction_id = *self;
        Ok(())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// MessageType is the 16-bit type field of the header.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct MessageType(pub u16);

pub const BINDING_REQUEST: MessageType = MessageType(0x0001);
pub const BINDING_RESPONSE: MessageType = MessageType(0x0101);
pub const BINDING_ERROR_RESPONSE: MessageType = MessageType(0x0111);
pub const SHARED_SECRET_REQUEST: MessageType = MessageType(0x0002);
pub const SHARED_SECRET_RESPONSE: MessageType = MessageType(0x0102);
pub const SHARED_SECRET_ERROR_RESPONSE: MessageType = MessageType(0x0112);
pub const ALLOCATE_REQUEST: MessageType = MessageType(0x0003);
pub const ALLOCATE_RESPONSE: MessageType = MessageType(0x0103);
pub const ALLOCATE_ERROR_RESPONSE: MessageType = MessageType(0x0113);
pub const SEND_REQUEST: MessageType = MessageType(0x0004);
pub const SEND_RESPONSE: MessageType = MessageType(0x0104);
pub const SEND_ERROR_RESPONSE: MessageType = MessageType(0x0114);
pub const DATA_INDICATION: MessageType = MessageType(0x0115);

impl MessageType {
    /// response_type returns the success response type answering this request type.
    pub fn response_type(self) -> MessageType {
        match self {
            SHARED_SECRET_REQUEST => SHARED_SECRET_RESPONSE,
            ALLOCATE_REQUEST => ALLOCATE_RESPONSE,
            SEND_REQUEST => SEND_RESPONSE,
            _ => BINDING_RESPONSE,
        }
    }

    /// error_response_type returns the error response type answering this request type.
    pub fn error_response_type(self) -> MessageType {
        match self {
            SHARED_SECRET_REQUEST => SHARED_SECRET_ERROR_RESPONSE,
            ALLOCATE_REQUEST => ALLOCATE_ERROR_RESPONSE,
            SEND_REQUEST => SEND_ERROR_RESPONSE,
            _ => BINDING_ERROR_RESPONSE,
        }
    }

    pub fn is_request(self) -> bool {
        self.0 & 0x0110 == 0x0000
    }

    pub fn is_response(self) -> bool {
        self.0 & 0x0110 == 0x0100
    }

    pub fn is_error_response(self) -> bool {
        self.0 & 0x0110 == 0x0110 && self != DATA_INDICATION
    }
}

impl Setter for MessageType {
    fn add_to(&self, m: &mut Message) -> Result<()> {
        m.typ = *self;
        Ok(())
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            BINDING_REQUEST => "binding request",
            BINDING_RESPONSE => "binding response",
            BINDING_ERROR_RESPONSE => "binding error response",
            SHARED_SECRET_REQUEST => "shared secret request",
            SHARED_SECRET_RESPONSE => "shared secret response",
            SHARED_SECRET_ERROR_RESPONSE => "shared secret error response",
            ALLOCATE_REQUEST => "allocate request",
            ALLOCATE_RESPONSE => "allocate response",
            ALLOCATE_ERROR_RESPONSE => "allocate error response",
            SEND_REQUEST => "send request",
            SEND_RESPONSE => "send response",
            SEND_ERROR_RESPONSE => "send error response",
            DATA_INDICATION => "data indication",
            MessageType(other) => return write!(f, "0x{other:04x}"),
        };
        write!(f, "{s}")
    }
}

/// Message is a STUN message: a header followed by a list of attributes.
///
/// Attribute values are kept raw; typed views are read and written through
/// the [`Getter`] and [`Setter`] implementations of the attribute types.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Message {
    pub typ: MessageType,
    pub transaction_id: TransactionId,
    pub attributes: Attributes,
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} l={} attrs={} id={}",
            self.typ,
            self.length(),
            self.attributes.0.len(),
            self.transaction_id
        )
    }
}

impl Message {
    /// new returns an empty message with a random transaction id.
    pub fn new(typ: MessageType) -> Self {
        Message {
            typ,
            transaction_id: TransactionId::new(),
            attributes: Attributes::default(),
        }
    }

    /// build resets the message and applies setters in order.
    pub fn build(&mut self, setters: &[Box<dyn Setter>]) -> Result<()> {
        self.attributes.0.clear();
        for s in setters {
            s.add_to(self)?;
        }
        Ok(())
    }

    /// add appends a raw attribute.
    pub fn add(&mut self, t: AttrType, v: &[u8]) -> Result<()> {
        if v.len() > u16::MAX as usize {
            return Err(Error::ErrAttributeSizeOverflow);
        }
        self.attributes.0.push(RawAttribute {
            typ: t,
            length: v.len() as u16,
            value: v.to_vec(),
        });
        Ok(())
    }

    /// get returns the value of the first attribute of type t.
    pub fn get(&self, t: AttrType) -> Result<&[u8]> {
        self.attributes
            .get(t)
            .map(|a| a.value.as_slice())
            .ok_or(Error::ErrAttributeNotFound)
    }

    pub fn contains(&self, t: AttrType) -> bool {
        self.attributes.get(t).is_some()
    }

    /// length returns the encoded body length, padding included.
    pub fn length(&self) -> usize {
        self.attributes
            .0
            .iter()
            .map(|a| ATTRIBUTE_HEADER_SIZE + nearest_padded_value_length(a.value.len()))
            .sum()
    }

    /// marshal encodes the message into its wire form.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let length = self.length();
        if length > u16::MAX as usize {
            return Err(Error::ErrMessageTooLarge);
        }

        let mut raw = Vec::with_capacity(MESSAGE_HEADER_SIZE + length);
        raw.put_u16(self.typ.0);
        raw.put_u16(length as u16);
        raw.put_slice(&self.transaction_id.0);
        for a in &self.attributes.0 {
            raw.put_u16(a.typ.0);
            raw.put_u16(a.length);
            raw.put_slice(&a.value);
            let padding = nearest_padded_value_length(a.value.len()) - a.value.len();
            raw.put_bytes(0, padding);
        }
        Ok(raw)
    }

    /// unmarshal decodes a whole datagram; any byte beyond the declared body
    /// length is an error.
    pub fn unmarshal(raw: &[u8]) -> Result<Self> {
        if raw.len() < MESSAGE_HEADER_SIZE {
            return Err(Error::ErrUnexpectedHeaderEof);
        }

        let typ = MessageType(u16::from_be_bytes([raw[0], raw[1]]));
        let length = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        let mut transaction_id = TransactionId::default();
        transaction_id
            .0
            .copy_from_slice(&raw[4..MESSAGE_HEADER_SIZE]);

        let body = &raw[MESSAGE_HEADER_SIZE..];
        if body.len() < length {
            return Err(Error::ErrUnexpectedEndOfBuffer {
                expected: length,
                actual: body.len(),
            });
        }
        if body.len() > length {
            return Err(Error::ErrTrailingBytes);
        }

        let mut attributes = Attributes::default();
        let mut offset = 0;
        while offset < length {
            if length - offset < ATTRIBUTE_HEADER_SIZE {
                return Err(Error::ErrUnexpectedEndOfBuffer {
                    expected: ATTRIBUTE_HEADER_SIZE,
                    actual: length - offset,
                });
            }
            let t = AttrType(u16::from_be_bytes([body[offset], body[offset + 1]]));
            let l = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
            offset += ATTRIBUTE_HEADER_SIZE;

            if length - offset < l {
                return Err(Error::ErrAttributeSizeOverflow);
            }
            t.check_value_size(l)?;

            attributes.0.push(RawAttribute {
                typ: t,
                length: l as u16,
                value: body[offset..offset + l].to_vec(),
            });
            offset += nearest_padded_value_length(l).min(length - offset);
        }

        Ok(Message {
            typ,
            transaction_id,
            attributes,
        })
    }
}
