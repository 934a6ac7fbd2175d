use bytes::BytesMut;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use super::{CandidateOrigin, PortBase};
use crate::candidate::{Candidate, ProtocolType};
use crate::connection::ConnectionId;
use crate::socket::{SocketEvent, SocketId, SocketRequest};
use shared::TransportProtocol;
use shared::error::*;

/// The stream behind a TCP connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TcpStream {
    /// Accepted by the listener; addressed by the peer address.
    Accepted,
    /// Opened by us; `local_addr` is known once connected.
    Outgoing {
        socket: SocketId,
        local_addr: Option<SocketAddr>,
    },
}

/// TcpPort listens for streams on a local address, which is its candidate,
/// and opens streams to TCP remotes.
#[derive(Debug)]
pub struct TcpPort {
    local_addr: SocketAddr,
    incoming_only: bool,
    listener: Option<SocketId>,
    bound_addr: Option<SocketAddr>,
    /// Accepted streams no connection claimed yet.
    incoming: Vec<SocketAddr>,
    streams: HashMap<SocketAddr, TcpStream>,
}

impl TcpPort {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            incoming_only: local_addr.port() != 0,
            listener: None,
            bound_addr: None,
            incoming: vec![],
            streams: HashMap::new(),
        }
    }

    /// A port bound to a fixed port number only takes incoming streams.
    pub fn incoming_only(&self) -> bool {
        self.incoming_only
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub(crate) fn sockets(&self) -> Vec<SocketId> {
        let mut sockets: Vec<SocketId> = self.listener.into_iter().collect();
        for stream in self.streams.values() {
            if let TcpStream::Outgoing { socket, .. } = stream {
                sockets.push(*socket);
            }
        }
        sockets
    }

    pub(crate) fn prepare_address(&mut self, base: &mut PortBase) {
        if self.listener.is_some() {
            return;
        }
        let socket = base.next_socket();
        self.listener = Some(socket);
        base.request_socket(SocketRequest::ListenTcp {
            socket,
            local_addr: self.local_addr,
        });
    }

    pub(crate) fn create_connection(
        &mut self,
        base: &mut PortBase,
        remote: &Candidate,
        origin: CandidateOrigin,
    ) -> Option<ConnectionId> {
        let protocol = remote.protocol();
        if protocol != ProtocolType::Tcp && protocol != ProtocolType::SslTcp {
            return None;
        }
        // streams arriving on other ports can't be answered from here
        if origin == CandidateOrigin::OtherPort {
            return None;
        }
        if self.incoming_only && origin == CandidateOrigin::Message {
            return None;
        }
        // no SSL server side
        if protocol == ProtocolType::SslTcp && origin == CandidateOrigin::ThisPort {
            return None;
        }

        let remote_addr = remote.address();
        if let Some(pos) = self.incoming.iter().position(|addr| *addr == remote_addr) {
            self.incoming.remove(pos);
            self.streams.insert(remote_addr, TcpStream::Accepted);
            return Some(base.add_connection(0, remote));
        }

        let socket = base.next_socket();
        info!("[{}]: connecting to {}", base.log_name(), remote_addr);
        base.request_socket(SocketRequest::ConnectTcp {
            socket,
            local_addr: SocketAddr::new(self.local_addr.ip(), 0),
            remote_addr,
            ssl: protocol == ProtocolType::SslTcp,
            proxy: base.proxy().clone(),
            user_agent: base.user_agent().to_owned(),
        });
        self.streams.insert(
            remote_addr,
            TcpStream::Outgoing {
                socket,
                local_addr: None,
            },
        );
        let id = base.add_connection(0, remote);
        if let Some(conn) = base.connection_mut(&remote_addr) {
            conn.set_pending_connect();
        }
        Some(id)
    }

    pub(crate) fn send_to(
        &mut self,
        base: &mut PortBase,
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<usize> {
        let local_addr = match self.streams.get(&addr) {
            Some(TcpStream::Accepted) => self.bound_addr,
            Some(TcpStream::Outgoing { local_addr, .. }) => {
                Some(local_addr.ok_or(Error::ErrWouldBlock)?)
            }
            None if self.incoming.contains(&addr) => self.bound_addr,
            None => None,
        };
        let Some(local_addr) = local_addr else {
            warn!("[{}]: unknown destination {}", base.log_name(), addr);
            return Err(Error::ErrUnknownDestination);
        };
        base.transmit(
            local_addr,
            addr,
            TransportProtocol::TCP,
            BytesMut::from(data),
            now,
        );
        Ok(data.len())
    }

    pub(crate) fn handle_socket_event(&mut self, base: &mut PortBase, event: SocketEvent) {
        match event {
            SocketEvent::Bound { socket, local_addr } if Some(socket) == self.listener => {
                if self.bound_addr.is_none() {
                    debug!("[{}]: listening on {}", base.log_name(), local_addr);
                    self.bound_addr = Some(local_addr);
                    base.add_address(local_addr, ProtocolType::Tcp, true);
                }
            }
            SocketEvent::Accepted { peer_addr, .. } => {
                info!("[{}]: accepted incoming stream from {}", base.log_name(), peer_addr);
                if !self.incoming.contains(&peer_addr) {
                    self.incoming.push(peer_addr);
                }
            }
            SocketEvent::Connected { socket, local_addr } => {
                let Some(remote_addr) = self.outgoing_remote(socket) else {
                    return;
                };
                info!("[{}]: connected to {}", base.log_name(), remote_addr);
                self.streams.insert(
                    remote_addr,
                    TcpStream::Outgoing {
                        socket,
                        local_addr: Some(local_addr),
                    },
                );
                if let Some(conn) = base.connection_mut(&remote_addr) {
                    conn.set_connected(true);
                }
            }
            SocketEvent::Closed { socket, peer_addr } => {
                let remote_addr = if Some(socket) == self.listener {
                    let Some(peer_addr) = peer_addr else {
                        warn!("[{}]: listener closed", base.log_name());
                        return;
                    };
                    self.incoming.retain(|addr| *addr != peer_addr);
                    peer_addr
                } else {
                    let Some(remote_addr) = self.outgoing_remote(socket) else {
                        return;
                    };
                    remote_addr
                };
                info!("[{}]: stream to {} closed", base.log_name(), remote_addr);
                self.stream_lost(base, remote_addr);
            }
            SocketEvent::Error { socket, reason } => {
                warn!("[{}]: socket {} error: {}", base.log_name(), socket, reason);
                if let Some(remote_addr) = self.outgoing_remote(socket) {
                    self.stream_lost(base, remote_addr);
                }
            }
            other => debug!("[{}]: ignoring {:?}", base.log_name(), other),
        }
    }

    fn outgoing_remote(&self, socket: SocketId) -> Option<SocketAddr> {
        self.streams.iter().find_map(|(addr, stream)| match stream {
            TcpStream::Outgoing { socket: s, .. } if *s == socket => Some(*addr),
            _ => None,
        })
    }

    fn stream_lost(&mut self, base: &mut PortBase, remote_addr: SocketAddr) {
        if self.streams.remove(&remote_addr).is_some() {
            if let Some(conn) = base.connection_mut(&remote_addr) {
                conn.set_connected(false);
            }
        }
    }

    /// Closes the stream we opened for a connection that went away.
    pub(crate) fn connection_destroyed(&mut self, base: &mut PortBase, remote_addr: SocketAddr) {
        if let Some(TcpStream::Outgoing { socket, .. }) = self.streams.remove(&remote_addr) {
            base.request_socket(SocketRequest::Close { socket });
        }
    }

    pub(crate) fn close(&mut self, base: &mut PortBase) {
        for socket in self.sockets() {
            base.request_socket(SocketRequest::Close { socket });
        }
        self.listener = None;
        self.bound_addr = None;
        self.incoming.clear();
        self.streams.clear();
    }
}
