use std::fmt;

use shared::error::*;

pub(crate) const ATTRIBUTE_HEADER_SIZE: usize = 4;
const PADDING: usize = 4;

/// Attributes is list of message attributes.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Attributes(pub Vec<RawAttribute>);

impl Attributes {
    /// get returns the first attribute from list by the type.
    pub fn get(&self, t: AttrType) -> Option<&RawAttribute> {
        self.0.iter().find(|candidate| candidate.typ == t)
    }
}

/// AttrType is attribute type.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Default, Debug)]
pub struct AttrType(pub u16);

pub const ATTR_MAPPED_ADDRESS: AttrType = AttrType(0x0001);
pub const ATTR_RESPONSE_ADDRESS: AttrType = AttrType(0x0002);
pub const ATTR_CHANGE_REQUEST: AttrType = AttrType(0x0003);
pub const ATTR_SOURCE_ADDRESS: AttrType = AttrType(0x0004);
pub const ATTR_CHANGED_ADDRESS: AttrType = AttrType(0x0005);
pub const ATTR_USERNAME: AttrType = AttrType(0x0006);
pub const ATTR_PASSWORD: AttrType = AttrType(0x0007);
pub const ATTR_MESSAGE_INTEGRITY: AttrType = AttrType(0x0008);
pub const ATTR_ERROR_CODE: AttrType = AttrType(0x0009);
pub const ATTR_UNKNOWN_ATTRIBUTES: AttrType = AttrType(0x000a);
pub const ATTR_REFLECTED_FROM: AttrType = AttrType(0x000b);
pub const ATTR_TRANSPORT_PREFERENCES: AttrType = AttrType(0x000c);
pub const ATTR_LIFETIME: AttrType = AttrType(0x000d);
pub const ATTR_ALTERNATE_SERVER: AttrType = AttrType(0x000e);
pub const ATTR_MAGIC_COOKIE: AttrType = AttrType(0x000f);
pub const ATTR_BANDWIDTH: AttrType = AttrType(0x0010);
pub const ATTR_DESTINATION_ADDRESS: AttrType = AttrType(0x0011);
pub const ATTR_SOURCE_ADDRESS2: AttrType = AttrType(0x0012);
pub const ATTR_DATA: AttrType = AttrType(0x0013);
pub const ATTR_OPTIONS: AttrType = AttrType(0x8001);

pub(crate) const ADDRESS_SIZE: usize = 8;
const UINT32_SIZE: usize = 4;
const MESSAGE_INTEGRITY_SIZE: usize = 20;

impl AttrType {
    /// check_value_size verifies the declared value length of a known attribute.
    pub(crate) fn check_value_size(self, l: usize) -> Result<()> {
        let valid = match self {
            ATTR_MAPPED_ADDRESS
            | ATTR_RESPONSE_ADDRESS
            | ATTR_SOURCE_ADDRESS
            | ATTR_CHANGED_ADDRESS
            | ATTR_REFLECTED_FROM
            | ATTR_ALTERNATE_SERVER
            | ATTR_DESTINATION_ADDRESS
            | ATTR_SOURCE_ADDRESS2 => l == ADDRESS_SIZE,
            ATTR_CHANGE_REQUEST | ATTR_LIFETIME | ATTR_BANDWIDTH | ATTR_OPTIONS => {
                l == UINT32_SIZE
            }
            ATTR_USERNAME | ATTR_PASSWORD | ATTR_MAGIC_COOKIE => l % 4 == 0,
            ATTR_MESSAGE_INTEGRITY => l == MESSAGE_INTEGRITY_SIZE,
            ATTR_ERROR_CODE => l >= 4,
            ATTR_UNKNOWN_ATTRIBUTES => {
                if l % 2 != 0 {
                    return Err(Error::ErrBadUnknownAttrsSize);
                }
                true
            }
            ATTR_TRANSPORT_PREFERENCES => l == 4 || l == 12,
            ATTR_DATA => true,
            AttrType(other) => return Err(Error::ErrUnknownAttributeType(other)),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::ErrAttributeSizeInvalid)
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ATTR_MAPPED_ADDRESS => "MAPPED-ADDRESS",
            ATTR_RESPONSE_ADDRESS => "RESPONSE-ADDRESS",
            ATTR_CHANGE_REQUEST => "CHANGE-REQUEST",
            ATTR_SOURCE_ADDRESS => "SOURCE-ADDRESS",
            ATTR_CHANGED_ADDRESS => "CHANGED-ADDRESS",
            ATTR_USERNAME => "USERNAME",
            ATTR_PASSWORD => "PASSWORD",
            ATTR_MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ATTR_ERROR_CODE => "ERROR-CODE",
            ATTR_UNKNOWN_ATTRIBUTES => "UNKNOWN-ATTRIBUTES",
            ATTR_REFLECTED_FROM => "REFLECTED-FROM",
            ATTR_TRANSPORT_PREFERENCES => "TRANSPORT-PREFERENCES",
            ATTR_LIFETIME => "LIFETIME",
            ATTR_ALTERNATE_SERVER => "ALTERNATE-SERVER",
            ATTR_MAGIC_COOKIE => "MAGIC-COOKIE",
            ATTR_BANDWIDTH => "BANDWIDTH",
            ATTR_DESTINATION_ADDRESS => "DESTINATION-ADDRESS",
            ATTR_SOURCE_ADDRESS2 => "SOURCE-ADDRESS2",
            ATTR_DATA => "DATA",
            ATTR_OPTIONS => "OPTIONS",
            AttrType(other) => return write!(f, "0x{other:x}"),
        };
        write!(f, "{s}")
    }
}

/// RawAttribute is a Type-Length-Value (TLV) object that
/// can be added to a STUN message. Attributes are divided into two
/// types: comprehension-required and comprehension-optional.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub typ: AttrType,
    pub length: u16, // ignored while encoding
    pub value: Vec<u8>,
}

impl fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.typ, self.value)
    }
}

pub(crate) fn nearest_padded_value_length(l: usize) -> usize {
    let mut n = PADDING * (l / PADDING);
    if n < l {
        n += PADDING;
    }
    n
}
