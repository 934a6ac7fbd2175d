#[cfg(test)]
mod tcp_port_test;

pub(crate) mod relay_port;
pub(crate) mod stun_port;
pub(crate) mod tcp_port;
pub(crate) mod udp_port;

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::binding::*;
use crate::candidate::{Candidate, CandidateType, ProtocolType};
use crate::connection::{Connection, ConnectionEvent, ConnectionId};
use crate::network::Network;
use crate::rand::{generate_pwd, generate_ufrag};
use crate::socket::{ProxyInfo, SocketEvent, SocketId, SocketRequest};
use shared::error::*;
use shared::{TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};
use stun::error_code::ErrorCode;
use stun::message::*;

pub use relay_port::{ProtocolAddress, RelayPort};
pub use stun_port::StunPort;
pub use tcp_port::TcpPort;
pub use udp_port::UdpPort;

/// A port sticks around at least this long before it may destroy itself.
pub(crate) const PORT_TIMEOUT_DELAY: Duration = Duration::from_secs(30);

/// Identifies a port: the allocator session that created it and its index
/// within that session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub session: u32,
    pub index: u32,
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.index)
    }
}

/// Where the remote candidate of a new connection came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CandidateOrigin {
    /// A ping arrived on this very port.
    ThisPort,
    /// A ping arrived on another port.
    OtherPort,
    /// The candidate was signaled by the remote side.
    Message,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lifetime {
    PreStart,
    PreTimeout(Instant),
    PostTimeout,
}

/// PortEvent is what a port reports to its owner.
#[derive(Debug)]
pub enum PortEvent {
    /// The port's candidates are ready to be advertised.
    AddressReady,
    ConnectionCreated(ConnectionId),
    ConnectionStateChange(ConnectionId),
    ConnectionDestroyed(ConnectionId),
    /// An authenticated ping arrived from an address with no connection.
    UnknownAddress {
        addr: SocketAddr,
        msg: Message,
        remote_username: String,
    },
    /// Application data arrived on a connection.
    ReadPacket {
        connection: ConnectionId,
        data: BytesMut,
    },
    /// The port outlived its minimum lifetime without connections.
    Destroyed,
}

/// State shared by every kind of port.
#[derive(Debug)]
pub struct PortBase {
    id: PortId,
    name: String,
    port_type: CandidateType,
    network: Network,
    preference: f32,
    generation: u32,
    username_fragment: String,
    password: String,
    proxy: ProxyInfo,
    user_agent: String,

    candidates: Vec<Candidate>,
    connections: HashMap<SocketAddr, Connection>,
    lifetime: Lifetime,
    destroyed: bool,
    next_socket_index: u32,

    outbox: VecDeque<(SocketAddr, BytesMut)>,
    transmits: VecDeque<TaggedBytesMut>,
    socket_requests: VecDeque<SocketRequest>,
    events: VecDeque<PortEvent>,
}

impl PortBase {
    pub(crate) fn new(id: PortId, port_type: CandidateType, network: Network) -> Self {
        Self {
            id,
            name: String::new(),
            port_type,
            network,
            preference: -1.0,
            generation: 0,
            username_fragment: generate_ufrag(),
            password: generate_pwd(),
            proxy: ProxyInfo::default(),
            user_agent: String::new(),
            candidates: vec![],
            connections: HashMap::new(),
            lifetime: Lifetime::PreStart,
            destroyed: false,
            next_socket_index: 0,
            outbox: VecDeque::new(),
            transmits: VecDeque::new(),
            socket_requests: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub(crate) fn log_name(&self) -> String {
        format!("{}-{}-{}", self.name, self.port_type, self.id)
    }

    /// Advertises `address`; a final address makes the port ready.
    pub(crate) fn add_address(&mut self, address: SocketAddr, protocol: ProtocolType, last: bool) {
        let candidate = Candidate {
            name: self.name.clone(),
            candidate_type: self.port_type,
            protocol,
            address,
            preference: self.preference,
            username: self.username_fragment.clone(),
            password: self.password.clone(),
            network_name: self.network.name().to_owned(),
            generation: self.generation,
        };
        debug!("[{}]: new candidate {}", self.log_name(), candidate);
        self.candidates.push(candidate);
        if last {
            self.events.push_back(PortEvent::AddressReady);
        }
    }

    pub(crate) fn signal_address_ready(&mut self) {
        self.events.push_back(PortEvent::AddressReady);
    }

    pub(crate) fn next_socket(&mut self) -> SocketId {
        let socket = SocketId {
            port: self.id,
            index: self.next_socket_index,
        };
        self.next_socket_index += 1;
        socket
    }

    pub(crate) fn request_socket(&mut self, request: SocketRequest) {
        trace!("[{}]: socket request {:?}", self.log_name(), request);
        self.socket_requests.push_back(request);
    }

    pub(crate) fn transmit(
        &mut self,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        transport_protocol: TransportProtocol,
        message: BytesMut,
        now: Instant,
    ) {
        self.transmits.push_back(TransportMessage {
            now,
            transport: TransportContext {
                local_addr,
                peer_addr,
                transport_protocol,
            },
            message,
        });
    }

    pub(crate) fn add_connection(&mut self, local_candidate: usize, remote: &Candidate) -> ConnectionId {
        let id = ConnectionId {
            port: self.id,
            remote_addr: remote.address(),
        };
        let conn = Connection::new(
            id,
            &self.log_name(),
            local_candidate,
            self.username_fragment.clone(),
            remote.clone(),
        );
        debug!("[{}]: created connection {}", self.log_name(), conn);
        self.connections.insert(remote.address(), conn);
        self.events.push_back(PortEvent::ConnectionCreated(id));
        id
    }

    pub(crate) fn connection_mut(&mut self, remote_addr: &SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(remote_addr)
    }

    pub(crate) fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub(crate) fn proxy(&self) -> &ProxyInfo {
        &self.proxy
    }

    pub(crate) fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub(crate) fn username_fragment(&self) -> &str {
        &self.username_fragment
    }

    pub(crate) fn network(&self) -> &Network {
        &self.network
    }

    pub(crate) fn port_type(&self) -> CandidateType {
        self.port_type
    }

    /// Dispatches a packet from `addr` to its connection, or handles it as a
    /// STUN server would when the address is unknown.
    pub(crate) fn on_read_packet(&mut self, data: BytesMut, addr: SocketAddr, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.handle_read(data, now);
            return;
        }

        let name = self.log_name();
        match parse_binding_message(&name, &data, &self.username_fragment) {
            BindingInput::Data => {
                error!("[{}]: received non-STUN packet from unknown address {}", name, addr);
            }
            BindingInput::Handled { reply } => {
                if let Some(reply) = reply {
                    self.queue_stun(addr, &reply);
                }
            }
            BindingInput::Message {
                msg,
                remote_username,
            } => {
                if msg.typ == BINDING_REQUEST {
                    self.events.push_back(PortEvent::UnknownAddress {
                        addr,
                        msg,
                        remote_username,
                    });
                } else {
                    error!(
                        "[{}]: received unexpected STUN message type {} from unknown address {}",
                        name, msg.typ, addr
                    );
                }
            }
        }
    }

    fn queue_stun(&mut self, addr: SocketAddr, msg: &Message) {
        match msg.marshal() {
            Ok(raw) => self.outbox.push_back((addr, BytesMut::from(&raw[..]))),
            Err(err) => warn!("[{}]: failed to encode {}: {}", self.log_name(), msg.typ, err),
        }
    }
}

/// The mechanism specific half of a port.
#[derive(Debug)]
pub enum PortKind {
    Udp(UdpPort),
    Stun(StunPort),
    Tcp(TcpPort),
    Relay(RelayPort),
}

impl PortKind {
    fn prepare_address(&mut self, base: &mut PortBase, now: Instant) {
        match self {
            PortKind::Udp(p) => p.prepare_address(base),
            PortKind::Stun(p) => p.prepare_address(base),
            PortKind::Tcp(p) => p.prepare_address(base),
            PortKind::Relay(p) => p.prepare_address(base, now),
        }
    }

    fn create_connection(
        &mut self,
        base: &mut PortBase,
        remote: &Candidate,
        origin: CandidateOrigin,
    ) -> Option<ConnectionId> {
        match self {
            PortKind::Udp(_) | PortKind::Stun(_) => udp_port::create_connection(base, remote),
            PortKind::Tcp(p) => p.create_connection(base, remote, origin),
            PortKind::Relay(p) => p.create_connection(base, remote, origin),
        }
    }

    fn send_to(
        &mut self,
        base: &mut PortBase,
        data: &[u8],
        addr: SocketAddr,
        payload: bool,
        now: Instant,
    ) -> Result<usize> {
        match self {
            PortKind::Udp(p) => p.send_to(base, data, addr, now),
            PortKind::Stun(p) => p.send_to(base, data, addr, now),
            PortKind::Tcp(p) => p.send_to(base, data, addr, now),
            PortKind::Relay(p) => p.send_to(base, data, addr, payload, now),
        }
    }

    fn handle_read(&mut self, base: &mut PortBase, socket: SocketId, msg: TaggedBytesMut) {
        match self {
            PortKind::Udp(_) | PortKind::Tcp(_) => {
                base.on_read_packet(msg.message, msg.transport.peer_addr, msg.now)
            }
            PortKind::Stun(p) => p.handle_read(base, msg),
            PortKind::Relay(p) => p.handle_read(base, socket, msg),
        }
    }

    fn handle_socket_event(&mut self, base: &mut PortBase, event: SocketEvent, now: Instant) {
        match self {
            PortKind::Udp(p) => p.handle_socket_event(base, event),
            PortKind::Stun(p) => p.handle_socket_event(base, event, now),
            PortKind::Tcp(p) => p.handle_socket_event(base, event),
            PortKind::Relay(p) => p.handle_socket_event(base, event, now),
        }
    }

    fn connection_destroyed(&mut self, base: &mut PortBase, remote_addr: SocketAddr) {
        if let PortKind::Tcp(p) = self {
            p.connection_destroyed(base, remote_addr);
        }
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        match self {
            PortKind::Udp(_) | PortKind::Tcp(_) => None,
            PortKind::Stun(p) => p.poll_timeout(),
            PortKind::Relay(p) => p.poll_timeout(),
        }
    }

    fn handle_timeout(&mut self, base: &mut PortBase, now: Instant) {
        match self {
            PortKind::Udp(_) | PortKind::Tcp(_) => {}
            PortKind::Stun(p) => p.handle_timeout(base, now),
            PortKind::Relay(p) => p.handle_timeout(base, now),
        }
    }

    fn close(&mut self, base: &mut PortBase) {
        match self {
            PortKind::Udp(p) => p.close(base),
            PortKind::Stun(p) => p.close(base),
            PortKind::Tcp(p) => p.close(base),
            PortKind::Relay(p) => p.close(base),
        }
    }

    fn sockets(&self) -> Vec<SocketId> {
        match self {
            PortKind::Udp(p) => p.socket().into_iter().collect(),
            PortKind::Stun(p) => p.socket().into_iter().collect(),
            PortKind::Tcp(p) => p.sockets(),
            PortKind::Relay(p) => p.sockets(),
        }
    }
}

/// Port is one local mechanism producing candidates. It owns the connections
/// that originate from those candidates and answers STUN pings for them.
#[derive(Debug)]
pub struct Port {
    base: PortBase,
    kind: PortKind,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port[{}:{}]", self.base.log_name(), self.base.network)
    }
}

impl Port {
    pub(crate) fn new(base: PortBase, kind: PortKind) -> Self {
        Self { base, kind }
    }

    pub fn id(&self) -> PortId {
        self.base.id
    }

    pub fn name(&self) -> &str {
        &self.base.name
    }

    pub fn port_type(&self) -> CandidateType {
        self.base.port_type
    }

    pub fn network(&self) -> &Network {
        &self.base.network
    }

    pub fn preference(&self) -> f32 {
        self.base.preference
    }

    pub fn generation(&self) -> u32 {
        self.base.generation
    }

    pub fn username_fragment(&self) -> &str {
        &self.base.username_fragment
    }

    pub fn password(&self) -> &str {
        &self.base.password
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.base.candidates
    }

    pub fn kind(&self) -> &PortKind {
        &self.kind
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.base.name = name.to_owned();
    }

    pub(crate) fn set_preference(&mut self, preference: f32) {
        self.base.preference = preference;
    }

    pub(crate) fn set_generation(&mut self, generation: u32) {
        self.base.generation = generation;
    }

    pub(crate) fn set_proxy(&mut self, user_agent: &str, proxy: ProxyInfo) {
        self.base.user_agent = user_agent.to_owned();
        self.base.proxy = proxy;
    }

    pub(crate) fn set_credentials(&mut self, username_fragment: String, password: String) {
        self.base.username_fragment = username_fragment;
        self.base.password = password;
    }

    /// Adds a relay server address to try, which is also advertised as a
    /// candidate of the port. Only relay ports take server addresses.
    pub(crate) fn add_relay_server(&mut self, addr: ProtocolAddress) {
        match &mut self.kind {
            PortKind::Relay(relay) => {
                relay.add_server_address(&self.base, addr);
                relay.add_external_address(&mut self.base, addr);
            }
            _ => warn!(
                "[{}]: relay server {} added to non-relay port",
                self.base.log_name(),
                addr
            ),
        }
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.base.connections.values()
    }

    pub fn connection(&self, remote_addr: &SocketAddr) -> Option<&Connection> {
        self.base.connections.get(remote_addr)
    }

    pub fn is_destroyed(&self) -> bool {
        self.base.destroyed
    }

    /// Sockets this port asked for and has not closed yet.
    pub fn sockets(&self) -> Vec<SocketId> {
        self.kind.sockets()
    }

    /// Starts resolving the port's address; readiness is reported with
    /// [`PortEvent::AddressReady`].
    pub fn prepare_address(&mut self, now: Instant) {
        self.kind.prepare_address(&mut self.base, now);
        self.flush(now);
    }

    /// Starts the minimum lifetime, after which the port destroys itself once
    /// it has no connections.
    pub fn start(&mut self, now: Instant) {
        if self.base.lifetime == Lifetime::PreStart {
            self.base.lifetime = Lifetime::PreTimeout(now + PORT_TIMEOUT_DELAY);
        } else {
            warn!("[{}]: port restart attempted", self.base.log_name());
        }
    }

    /// Creates a connection to `remote` unless this kind of port can't reach
    /// it from the given origin.
    pub fn create_connection(
        &mut self,
        remote: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Option<ConnectionId> {
        if self.base.destroyed {
            return None;
        }
        if self.base.connections.contains_key(&remote.address()) {
            warn!(
                "[{}]: connection to {} already exists",
                self.base.log_name(),
                remote.address()
            );
            return None;
        }
        let id = self.kind.create_connection(&mut self.base, remote, origin);
        self.flush(now);
        id
    }

    /// Sends application data over the connection to `remote_addr`.
    pub fn send(&mut self, remote_addr: SocketAddr, data: &[u8], now: Instant) -> Result<usize> {
        let writable = self
            .base
            .connections
            .get(&remote_addr)
            .ok_or(Error::ErrConnectionNotFound)?
            .writable();
        if !writable {
            return Err(Error::ErrWouldBlock);
        }

        let n = self
            .kind
            .send_to(&mut self.base, data, remote_addr, true, now)?;
        if let Some(conn) = self.base.connections.get_mut(&remote_addr) {
            conn.record_sent(n);
        }
        self.flush(now);
        Ok(n)
    }

    /// Sends raw bytes to `addr`. Payload sends may open new paths on relay
    /// ports; STUN traffic never does.
    pub fn send_to(&mut self, data: &[u8], addr: SocketAddr, payload: bool, now: Instant) -> Result<usize> {
        let n = self.kind.send_to(&mut self.base, data, addr, payload, now)?;
        self.flush(now);
        Ok(n)
    }

    /// Answers a ping from `addr`, which makes its connection readable.
    pub fn send_binding_response(&mut self, request: &Message, addr: SocketAddr, now: Instant) {
        match binding_response(request, addr) {
            Ok(response) => self.base.queue_stun(addr, &response),
            Err(err) => warn!("[{}]: binding response: {}", self.base.log_name(), err),
        }
        match self.base.connections.get_mut(&addr) {
            Some(conn) => conn.received_ping(now),
            None => warn!(
                "[{}]: answered ping from {} without connection",
                self.base.log_name(),
                addr
            ),
        }
        self.flush(now);
    }

    pub fn send_binding_error_response(
        &mut self,
        request: &Message,
        addr: SocketAddr,
        code: ErrorCode,
        now: Instant,
    ) {
        match binding_error_response(request, code) {
            Ok(response) => self.base.queue_stun(addr, &response),
            Err(err) => warn!("[{}]: binding error response: {}", self.base.log_name(), err),
        }
        self.flush(now);
    }

    /// Marks the connection to `remote_addr` readable, as a ping from it does.
    pub fn received_ping(&mut self, remote_addr: SocketAddr, now: Instant) {
        if let Some(conn) = self.base.connections.get_mut(&remote_addr) {
            conn.received_ping(now);
        }
        self.flush(now);
    }

    pub fn ping(&mut self, remote_addr: SocketAddr, now: Instant) -> Result<()> {
        let conn = self
            .base
            .connections
            .get_mut(&remote_addr)
            .ok_or(Error::ErrConnectionNotFound)?;
        let result = conn.ping(now);
        self.flush(now);
        result
    }

    pub fn update_connection_state(&mut self, remote_addr: SocketAddr, now: Instant) {
        if let Some(conn) = self.base.connections.get_mut(&remote_addr) {
            conn.update_state(now);
        }
        self.flush(now);
    }

    pub fn prune_connection(&mut self, remote_addr: SocketAddr, now: Instant) {
        if let Some(conn) = self.base.connections.get_mut(&remote_addr) {
            conn.prune();
        }
        self.flush(now);
    }

    pub fn destroy_connection(&mut self, remote_addr: SocketAddr, now: Instant) {
        if let Some(conn) = self.base.connections.get_mut(&remote_addr) {
            conn.destroy();
        }
        self.flush(now);
    }

    /// Marks every connection for destruction.
    pub fn destroy_connections(&mut self, now: Instant) {
        for conn in self.base.connections.values_mut() {
            conn.destroy();
        }
        self.flush(now);
    }

    pub(crate) fn handle_read(&mut self, socket: SocketId, msg: TaggedBytesMut) {
        let now = msg.now;
        self.kind.handle_read(&mut self.base, socket, msg);
        self.flush(now);
    }

    pub(crate) fn handle_socket_event(&mut self, event: SocketEvent, now: Instant) {
        self.kind.handle_socket_event(&mut self.base, event, now);
        self.flush(now);
    }

    pub fn poll_timeout(&mut self) -> Option<Instant> {
        let mut deadline = self.kind.poll_timeout();
        if let Lifetime::PreTimeout(t) = self.base.lifetime {
            deadline = Some(deadline.map_or(t, |d| d.min(t)));
        }
        for conn in self.base.connections.values_mut() {
            if let Some(t) = conn.poll_timeout() {
                deadline = Some(deadline.map_or(t, |d| d.min(t)));
            }
        }
        deadline
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.kind.handle_timeout(&mut self.base, now);
        for conn in self.base.connections.values_mut() {
            conn.handle_timeout(now);
        }
        if matches!(self.base.lifetime, Lifetime::PreTimeout(t) if t <= now) {
            self.base.lifetime = Lifetime::PostTimeout;
        }
        self.flush(now);
    }

    pub fn poll_transmit(&mut self) -> Option<TaggedBytesMut> {
        self.base.transmits.pop_front()
    }

    pub fn poll_socket_request(&mut self) -> Option<SocketRequest> {
        self.base.socket_requests.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<PortEvent> {
        self.base.events.pop_front()
    }

    /// Releases every socket and drops the connections.
    pub fn close(&mut self) {
        self.base.connections.clear();
        self.kind.close(&mut self.base);
    }

    /// Moves queued STUN traffic onto the wire and turns connection output
    /// into port events, then removes the connections that timed out.
    fn flush(&mut self, now: Instant) {
        let mut stun = std::mem::take(&mut self.base.outbox);
        let mut changed = vec![];
        let mut dead = vec![];
        for (addr, conn) in self.base.connections.iter_mut() {
            while let Some(raw) = conn.poll_outbox() {
                stun.push_back((*addr, raw));
            }
            while let Some(data) = conn.poll_read() {
                self.base.events.push_back(PortEvent::ReadPacket {
                    connection: conn.id(),
                    data,
                });
            }
            while let Some(ConnectionEvent::StateChange) = conn.poll_event() {
                if !changed.contains(&conn.id()) {
                    changed.push(conn.id());
                }
            }
            if conn.pending_delete() {
                dead.push(*addr);
            }
        }

        for (addr, raw) in stun {
            if let Err(err) = self.kind.send_to(&mut self.base, &raw, addr, false, now) {
                debug!(
                    "[{}]: failed to send STUN to {}: {}",
                    self.base.log_name(),
                    addr,
                    err
                );
            }
        }
        for id in changed {
            self.base.events.push_back(PortEvent::ConnectionStateChange(id));
        }
        for addr in dead {
            if let Some(conn) = self.base.connections.remove(&addr) {
                info!("[{}]: removed connection {}", self.base.log_name(), conn);
                self.kind.connection_destroyed(&mut self.base, addr);
                self.base
                    .events
                    .push_back(PortEvent::ConnectionDestroyed(conn.id()));
            }
        }
        self.check_timeout();
    }

    fn check_timeout(&mut self) {
        if self.base.lifetime == Lifetime::PostTimeout
            && self.base.connections.is_empty()
            && !self.base.destroyed
        {
            info!("[{}]: destroying port", self.base.log_name());
            self.base.destroyed = true;
            self.kind.close(&mut self.base);
            self.base.events.push_back(PortEvent::Destroyed);
        }
    }
}
