use bytes::BytesMut;
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Instant;

use super::PortBase;
use crate::candidate::{Candidate, ProtocolType};
use crate::connection::ConnectionId;
use crate::socket::{SocketEvent, SocketId, SocketRequest};
use shared::TransportProtocol;
use shared::error::*;

/// UdpPort binds one local datagram socket; its bound address is the
/// candidate.
#[derive(Debug)]
pub struct UdpPort {
    local_addr: SocketAddr,
    socket: Option<SocketId>,
    bound_addr: Option<SocketAddr>,
}

impl UdpPort {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            socket: None,
            bound_addr: None,
        }
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub(crate) fn socket(&self) -> Option<SocketId> {
        self.socket
    }

    /// Asks for the socket once; later calls are no-ops.
    pub(crate) fn prepare_address(&mut self, base: &mut PortBase) {
        if self.socket.is_some() {
            return;
        }
        let socket = base.next_socket();
        self.socket = Some(socket);
        base.request_socket(SocketRequest::BindUdp {
            socket,
            local_addr: self.local_addr,
        });
    }

    /// Handles the socket answer; returns the bound address the first time
    /// the socket comes up.
    pub(crate) fn on_socket_event(
        &mut self,
        base: &mut PortBase,
        event: SocketEvent,
    ) -> Option<SocketAddr> {
        if Some(event.socket()) != self.socket {
            return None;
        }
        match event {
            SocketEvent::Bound { local_addr, .. } if self.bound_addr.is_none() => {
                debug!("[{}]: bound to {}", base.log_name(), local_addr);
                self.bound_addr = Some(local_addr);
                Some(local_addr)
            }
            SocketEvent::Error { reason, .. } => {
                warn!("[{}]: socket error: {}", base.log_name(), reason);
                None
            }
            other => {
                debug!("[{}]: ignoring {:?}", base.log_name(), other);
                None
            }
        }
    }

    pub(crate) fn handle_socket_event(&mut self, base: &mut PortBase, event: SocketEvent) {
        if let Some(local_addr) = self.on_socket_event(base, event) {
            base.add_address(local_addr, ProtocolType::Udp, true);
        }
    }

    pub(crate) fn send_to(
        &mut self,
        base: &mut PortBase,
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<usize> {
        let local_addr = self.bound_addr.ok_or(Error::ErrSocketNotBound)?;
        base.transmit(
            local_addr,
            addr,
            TransportProtocol::UDP,
            BytesMut::from(data),
            now,
        );
        Ok(data.len())
    }

    pub(crate) fn close(&mut self, base: &mut PortBase) {
        if let Some(socket) = self.socket.take() {
            base.request_socket(SocketRequest::Close { socket });
        }
        self.bound_addr = None;
    }
}

/// Datagram ports pair their single candidate with UDP remotes only.
pub(crate) fn create_connection(base: &mut PortBase, remote: &Candidate) -> Option<ConnectionId> {
    if remote.protocol() != ProtocolType::Udp {
        return None;
    }
    Some(base.add_connection(0, remote))
}
