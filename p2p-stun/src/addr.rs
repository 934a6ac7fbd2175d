use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use crate::attributes::*;
use crate::message::*;
use shared::error::*;

pub const FAMILY_IPV4: u8 = 0x01;

/// MappedAddress represents MAPPED-ADDRESS and every other address valued
/// attribute: one zero byte, the family, the port and the IPv4 address.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub struct MappedAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Default for MappedAddress {
    fn default() -> Self {
        MappedAddress {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }
}

impl fmt::Display for MappedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl TryFrom<SocketAddr> for MappedAddress {
    type Error = Error;

    fn try_from(addr: SocketAddr) -> Result<Self> {
        match addr.ip() {
            IpAddr::V4(ip) => Ok(MappedAddress {
                ip,
                port: addr.port(),
            }),
            IpAddr::V6(_) => Err(Error::ErrBadAddressFamily),
        }
    }
}

impl From<MappedAddress> for SocketAddr {
    fn from(addr: MappedAddress) -> Self {
        SocketAddr::V4(SocketAddrV4::new(addr.ip, addr.port))
    }
}

impl Setter for MappedAddress {
    /// add_to adds MAPPED-ADDRESS to message.
    fn add_to(&self, m: &mut Message) -> Result<()> {
        self.add_to_as(m, ATTR_MAPPED_ADDRESS)
    }
}

impl Getter for MappedAddress {
    /// get_from decodes MAPPED-ADDRESS from message.
    fn get_from(&mut self, m: &Message) -> Result<()> {
        self.get_from_as(m, ATTR_MAPPED_ADDRESS)
    }
}

impl MappedAddress {
    /// get_from_as decodes an address attribute of type t. Only the IPv4
    /// family is understood.
    pub fn get_from_as(&mut self, m: &Message, t: AttrType) -> Result<()> {
        let v = m.get(t)?;
        if v.len() != ADDRESS_SIZE {
            return Err(Error::ErrAttributeSizeInvalid);
        }
        if v[1] != FAMILY_IPV4 {
            return Err(Error::ErrBadAddressFamily);
        }
        self.port = u16::from_be_bytes([v[2], v[3]]);
        self.ip = Ipv4Addr::new(v[4], v[5], v[6], v[7]);
        Ok(())
    }

    /// add_to_as adds an address attribute of type t to message.
    pub fn add_to_as(&self, m: &mut Message, t: AttrType) -> Result<()> {
        let mut value = [0u8; ADDRESS_SIZE];
        value[1] = FAMILY_IPV4;
        value[2..4].copy_from_slice(&self.port.to_be_bytes());
        value[4..].copy_from_slice(&self.ip.octets());
        m.add(t, &value)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::from(*self)
    }
}
