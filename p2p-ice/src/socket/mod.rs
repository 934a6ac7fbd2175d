use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::port::PortId;
use shared::TaggedBytesMut;

/// Identifies a socket a port asked its owner to open.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    pub port: PortId,
    pub index: u32,
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.index)
    }
}

/// Kind of outbound proxy TCP based ports go through.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProxyType {
    #[default]
    None,
    Socks5,
    Https,
    /// Proxy of undetermined kind, tried as HTTPS.
    Unknown,
}

/// ProxyInfo describes the outbound proxy for TCP connections.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub proxy_type: ProxyType,
    pub address: Option<SocketAddr>,
    pub username: String,
    pub password: String,
}

impl ProxyInfo {
    /// Whether connections are tunneled through an HTTPS style proxy, which
    /// only lets SSL looking traffic pass.
    pub fn is_https_like(&self) -> bool {
        matches!(self.proxy_type, ProxyType::Https | ProxyType::Unknown)
    }
}

/// SocketRequest is what a port needs the owner of the sockets to do.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketRequest {
    /// Bind a UDP socket on `local_addr` (port 0 picks any port) and answer
    /// with [`SocketEvent::Bound`].
    BindUdp {
        socket: SocketId,
        local_addr: SocketAddr,
    },
    /// Listen for TCP streams on `local_addr` and answer with
    /// [`SocketEvent::Bound`], then [`SocketEvent::Accepted`] per stream.
    ListenTcp {
        socket: SocketId,
        local_addr: SocketAddr,
    },
    /// Open a TCP stream to `remote_addr` from `local_addr`, through `proxy`
    /// when one is configured, and answer with [`SocketEvent::Connected`].
    /// Packets on the stream are tagged with `remote_addr` as peer address.
    ConnectTcp {
        socket: SocketId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        ssl: bool,
        proxy: ProxyInfo,
        user_agent: String,
    },
    /// Release the socket.
    Close { socket: SocketId },
}

impl SocketRequest {
    pub fn socket(&self) -> SocketId {
        match self {
            SocketRequest::BindUdp { socket, .. }
            | SocketRequest::ListenTcp { socket, .. }
            | SocketRequest::ConnectTcp { socket, .. }
            | SocketRequest::Close { socket } => *socket,
        }
    }
}

/// SocketEvent is how the owner of the sockets reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// A UDP socket or TCP listener is ready on `local_addr`.
    Bound {
        socket: SocketId,
        local_addr: SocketAddr,
    },
    /// An outgoing TCP stream is established from `local_addr`.
    Connected {
        socket: SocketId,
        local_addr: SocketAddr,
    },
    /// A listener accepted a stream from `peer_addr`.
    Accepted {
        listener: SocketId,
        peer_addr: SocketAddr,
    },
    /// A stream closed. `peer_addr` names the accepted stream for listeners.
    Closed {
        socket: SocketId,
        peer_addr: Option<SocketAddr>,
    },
    /// The socket could not be bound, connected or used.
    Error { socket: SocketId, reason: String },
}

impl SocketEvent {
    pub fn socket(&self) -> SocketId {
        match self {
            SocketEvent::Bound { socket, .. }
            | SocketEvent::Connected { socket, .. }
            | SocketEvent::Closed { socket, .. }
            | SocketEvent::Error { socket, .. } => *socket,
            SocketEvent::Accepted { listener, .. } => *listener,
        }
    }
}

/// Bytes that arrived on a socket a port asked for.
#[derive(Debug)]
pub struct SocketData {
    pub socket: SocketId,
    pub msg: TaggedBytesMut,
}

/// A socket event along with the time it was observed.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketNotice {
    pub now: Instant,
    pub event: SocketEvent,
}
