use bytes::BytesMut;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

/// Protocol a socket speaks. TLS wrapped TCP is still TCP at this level.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportProtocol {
    #[default]
    UDP,
    TCP,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            TransportProtocol::UDP => "udp",
            TransportProtocol::TCP => "tcp",
        };
        write!(f, "{s}")
    }
}

/// Where a packet was read or is to be written: the local socket address,
/// the remote address and the protocol.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub transport_protocol: TransportProtocol,
}

impl Default for TransportContext {
    fn default() -> Self {
        let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        Self {
            local_addr: any,
            peer_addr: any,
            transport_protocol: TransportProtocol::UDP,
        }
    }
}

/// A packet along with its [TransportContext] and the time it was read or
/// queued.
#[derive(Debug, Clone)]
pub struct TransportMessage<T> {
    pub now: Instant,
    pub transport: TransportContext,
    pub message: T,
}

/// The byte packets ports read and write.
pub type TaggedBytesMut = TransportMessage<BytesMut>;
