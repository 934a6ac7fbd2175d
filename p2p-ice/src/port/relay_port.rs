use bytes::BytesMut;
use log::{debug, info, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::{CandidateOrigin, PortBase};
use crate::candidate::{Candidate, ProtocolType};
use crate::connection::ConnectionId;
use crate::socket::{SocketEvent, SocketId, SocketRequest};
use shared::TaggedBytesMut;
use shared::error::*;
use stun::addr::MappedAddress;
use stun::attributes::{ATTR_DESTINATION_ADDRESS, ATTR_SOURCE_ADDRESS2, ATTR_USERNAME};
use stun::data::{Data, MagicCookie, has_magic_cookie};
use stun::error_code::ErrorCodeAttribute;
use stun::message::*;
use stun::options::{OPTION_LOCKED, Options};
use stun::request::{StunRequestEvent, StunRequestManager};
use stun::textattrs::Username;

/// Interval between allocation refreshes.
pub(crate) const RELAY_KEEPALIVE_DELAY: Duration = Duration::from_secs(10 * 60);
/// Connect attempts of an entry, across server addresses, stop this long
/// after the first one.
pub(crate) const RELAY_RETRY_TIMEOUT: Duration = Duration::from_secs(50);

/// A relay server address and the protocol to reach it with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolAddress {
    pub address: SocketAddr,
    pub protocol: ProtocolType,
}

impl ProtocolAddress {
    pub fn new(address: SocketAddr, protocol: ProtocolType) -> Self {
        Self { address, protocol }
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.protocol, self.address)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct AllocateRequest {
    start: Instant,
}

/// One connection to the relay server, ideally used for a single
/// destination so packets to it can go unwrapped once locked.
#[derive(Debug)]
struct RelayEntry {
    ext_addr: Option<SocketAddr>,
    server_index: usize,
    server: Option<ProtocolAddress>,
    socket: Option<SocketId>,
    local_addr: Option<SocketAddr>,
    connected: bool,
    locked: bool,
    chain_start: Option<Instant>,
    requests: StunRequestManager<AllocateRequest>,
}

impl RelayEntry {
    fn new(ext_addr: Option<SocketAddr>, server_index: usize) -> Self {
        let name = match ext_addr {
            Some(addr) => format!("relay-entry-{addr}"),
            None => "relay-entry".to_owned(),
        };
        Self {
            ext_addr,
            server_index,
            server: None,
            socket: None,
            local_addr: None,
            connected: false,
            locked: false,
            chain_start: None,
            requests: StunRequestManager::new(name),
        }
    }

    /// Sends a packet to the server as is.
    fn send_packet(&self, base: &mut PortBase, data: BytesMut, now: Instant) -> Result<usize> {
        let (Some(local_addr), Some(server)) = (self.local_addr, self.server) else {
            return Err(Error::ErrSocketNotBound);
        };
        let n = data.len();
        base.transmit(
            local_addr,
            server.address,
            server.protocol.transport_protocol(),
            data,
            now,
        );
        Ok(n)
    }

    /// Sends `data` to `addr` through the server, wrapped in a SEND request
    /// unless the entry is locked to `addr`.
    fn send_to(
        &self,
        base: &mut PortBase,
        magic_cookie: &[u8],
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<usize> {
        if self.locked && self.ext_addr == Some(addr) {
            return self.send_packet(base, BytesMut::from(data), now);
        }

        let mut request = Message::new(SEND_REQUEST);
        MagicCookie(magic_cookie.to_vec()).add_to(&mut request)?;
        Username::new(ATTR_USERNAME, base.username_fragment().to_owned()).add_to(&mut request)?;
        MappedAddress::try_from(addr)?.add_to_as(&mut request, ATTR_DESTINATION_ADDRESS)?;
        if self.ext_addr == Some(addr) {
            Options(OPTION_LOCKED).add_to(&mut request)?;
        }
        Data(data.to_vec()).add_to(&mut request)?;
        let raw = request.marshal()?;
        self.send_packet(base, BytesMut::from(&raw[..]), now)
    }

    fn flush(&mut self, base: &mut PortBase, now: Instant) {
        while let Some(raw) = self.requests.poll_transmit() {
            if let Err(err) = self.send_packet(base, raw, now) {
                debug!("[{}]: dropping allocate request: {}", base.log_name(), err);
            }
        }
    }
}

/// RelayPort obtains addresses on a relay server and forwards traffic
/// through it.
#[derive(Debug)]
pub struct RelayPort {
    local_ip: IpAddr,
    server_addrs: VecDeque<ProtocolAddress>,
    entries: Vec<RelayEntry>,
    ready: bool,
    magic_cookie: Vec<u8>,
}

impl RelayPort {
    pub(crate) fn new(local_ip: IpAddr, magic_cookie: Vec<u8>) -> Self {
        let magic_cookie = if magic_cookie.is_empty() {
            MagicCookie::default().0
        } else {
            magic_cookie
        };
        Self {
            local_ip,
            server_addrs: VecDeque::new(),
            entries: vec![RelayEntry::new(None, 0)],
            ready: false,
            magic_cookie,
        }
    }

    pub fn magic_cookie(&self) -> &[u8] {
        &self.magic_cookie
    }

    pub fn server_addrs(&self) -> impl Iterator<Item = &ProtocolAddress> {
        self.server_addrs.iter()
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Whether the entry for `addr` has been locked by the server.
    pub fn is_locked(&self, addr: SocketAddr) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.ext_addr == Some(addr) && entry.locked)
    }

    pub(crate) fn sockets(&self) -> Vec<SocketId> {
        self.entries.iter().filter_map(|entry| entry.socket).collect()
    }

    pub(crate) fn add_server_address(&mut self, base: &PortBase, addr: ProtocolAddress) {
        // HTTPS proxies usually only pass port 443
        if addr.protocol == ProtocolType::SslTcp && base.proxy().is_https_like() {
            self.server_addrs.push_front(addr);
        } else {
            self.server_addrs.push_back(addr);
        }
    }

    pub(crate) fn add_external_address(&mut self, base: &mut PortBase, addr: ProtocolAddress) {
        let redundant = base
            .candidates()
            .iter()
            .any(|c| c.address() == addr.address && c.protocol() == addr.protocol);
        if redundant {
            info!("[{}]: redundant relay address {}", base.log_name(), addr);
            return;
        }
        base.add_address(addr.address, addr.protocol, false);
    }

    fn set_ready(&mut self, base: &mut PortBase) {
        if !self.ready {
            self.ready = true;
            base.signal_address_ready();
        }
    }

    pub(crate) fn prepare_address(&mut self, base: &mut PortBase, now: Instant) {
        self.connect(base, 0, now);
        self.ready = false;
    }

    fn connect(&mut self, base: &mut PortBase, index: usize, now: Instant) {
        let Some(entry) = self.entries.get_mut(index) else {
            return;
        };
        if entry.socket.is_some() {
            return;
        }
        let Some(server) = self.server_addrs.get(entry.server_index).copied() else {
            warn!("[{}]: out of relay server connections", base.log_name());
            return;
        };
        let start = *entry.chain_start.get_or_insert(now);
        if now.saturating_duration_since(start) > RELAY_RETRY_TIMEOUT {
            warn!(
                "[{}]: giving up on relay servers after {:?}",
                base.log_name(),
                RELAY_RETRY_TIMEOUT
            );
            return;
        }

        info!("[{}]: connecting to relay via {}", base.log_name(), server);
        let socket = base.next_socket();
        let local_addr = SocketAddr::new(self.local_ip, 0);
        entry.socket = Some(socket);
        entry.server = Some(server);
        let request = match server.protocol {
            ProtocolType::Udp => SocketRequest::BindUdp { socket, local_addr },
            ProtocolType::Tcp | ProtocolType::SslTcp => SocketRequest::ConnectTcp {
                socket,
                local_addr,
                remote_addr: server.address,
                ssl: server.protocol == ProtocolType::SslTcp,
                proxy: base.proxy().clone(),
                user_agent: base.user_agent().to_owned(),
            },
        };
        base.request_socket(request);
    }

    fn send_allocate(&mut self, base: &mut PortBase, index: usize, delay: Duration, now: Instant) {
        let mut msg = Message::new(ALLOCATE_REQUEST);
        let built = MagicCookie(self.magic_cookie.clone())
            .add_to(&mut msg)
            .and_then(|_| {
                Username::new(ATTR_USERNAME, base.username_fragment().to_owned()).add_to(&mut msg)
            });
        if let Err(err) = built {
            warn!("[{}]: failed to build allocate request: {}", base.log_name(), err);
            return;
        }
        let entry = &mut self.entries[index];
        let request = AllocateRequest { start: now + delay };
        if let Err(err) = entry.requests.send_delayed(request, msg, delay, now) {
            warn!("[{}]: failed to send allocate request: {}", base.log_name(), err);
        }
        entry.flush(base, now);
    }

    fn on_connect(&mut self, base: &mut PortBase, index: usize, mapped_addr: SocketAddr) {
        info!("[{}]: relay allocate succeeded: udp @ {}", base.log_name(), mapped_addr);
        let entry = &mut self.entries[index];
        entry.connected = true;
        entry.chain_start = None;
        self.add_external_address(base, ProtocolAddress::new(mapped_addr, ProtocolType::Udp));
        self.set_ready(base);
    }

    /// Gives up the current server address and tries the next one.
    fn handle_connect_failure(&mut self, base: &mut PortBase, index: usize, now: Instant) {
        let entry = &mut self.entries[index];
        entry.connected = false;
        if let Some(socket) = entry.socket.take() {
            base.request_socket(SocketRequest::Close { socket });
        }
        entry.local_addr = None;
        entry.requests.clear();
        entry.server_index += 1;
        self.connect(base, index, now);
    }

    fn process_events(&mut self, base: &mut PortBase, index: usize, now: Instant) {
        while let Some(event) = self.entries[index].requests.poll_event() {
            match event {
                StunRequestEvent::Response { response, .. } => {
                    let mut mapped = MappedAddress::default();
                    match mapped.get_from(&response) {
                        Ok(()) => self.on_connect(base, index, mapped.socket_addr()),
                        Err(err) => {
                            info!("[{}]: bad allocate response: {}", base.log_name(), err)
                        }
                    }
                    // keep alive regardless of the outcome
                    self.send_allocate(base, index, RELAY_KEEPALIVE_DELAY, now);
                }
                StunRequestEvent::ErrorResponse { kind, response, .. } => {
                    let mut error_code = ErrorCodeAttribute::default();
                    match error_code.get_from(&response) {
                        Ok(()) => info!(
                            "[{}]: allocate error response: {}",
                            base.log_name(),
                            error_code
                        ),
                        Err(_) => info!("[{}]: bad allocate error code", base.log_name()),
                    }
                    if now.saturating_duration_since(kind.start) <= RELAY_RETRY_TIMEOUT {
                        self.send_allocate(base, index, RELAY_KEEPALIVE_DELAY, now);
                    }
                }
                StunRequestEvent::Timeout { .. } => {
                    info!("[{}]: allocate request timed out", base.log_name());
                    self.handle_connect_failure(base, index, now);
                }
            }
        }
    }

    pub(crate) fn handle_socket_event(&mut self, base: &mut PortBase, event: SocketEvent, now: Instant) {
        let socket = event.socket();
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.socket == Some(socket))
        else {
            return;
        };

        match event {
            SocketEvent::Bound { local_addr, .. } | SocketEvent::Connected { local_addr, .. } => {
                debug!("[{}]: relay socket up on {}", base.log_name(), local_addr);
                self.entries[index].local_addr = Some(local_addr);
                self.send_allocate(base, index, Duration::ZERO, now);
            }
            SocketEvent::Closed { .. } => {
                warn!("[{}]: relay connection closed", base.log_name());
                self.handle_connect_failure(base, index, now);
            }
            SocketEvent::Error { reason, .. } => {
                warn!("[{}]: relay connection failed: {}", base.log_name(), reason);
                self.handle_connect_failure(base, index, now);
            }
            SocketEvent::Accepted { .. } => {}
        }
    }

    pub(crate) fn create_connection(
        &mut self,
        base: &mut PortBase,
        remote: &Candidate,
        origin: CandidateOrigin,
    ) -> Option<ConnectionId> {
        // only udp remotes unless they pinged us here
        if remote.protocol() != ProtocolType::Udp && origin != CandidateOrigin::ThisPort {
            return None;
        }
        // no relay to relay
        if remote.candidate_type() == base.port_type() {
            return None;
        }
        let index = base
            .candidates()
            .iter()
            .position(|local| local.protocol() == remote.protocol())
            .unwrap_or(0);
        Some(base.add_connection(index, remote))
    }

    pub(crate) fn send_to(
        &mut self,
        base: &mut PortBase,
        data: &[u8],
        addr: SocketAddr,
        payload: bool,
        now: Instant,
    ) -> Result<usize> {
        // the first entry adopts the first payload destination
        let mut found = None;
        for (i, entry) in self.entries.iter_mut().enumerate() {
            if entry.ext_addr.is_none() && payload {
                entry.ext_addr = Some(addr);
                found = Some(i);
                break;
            } else if entry.ext_addr == Some(addr) {
                found = Some(i);
                break;
            }
        }

        // a new entry is not usable until connected
        if found.is_none() && payload {
            let server_index = self.entries.first().map_or(0, |e| e.server_index);
            self.entries.push(RelayEntry::new(Some(addr), server_index));
            let index = self.entries.len() - 1;
            self.connect(base, index, now);
            found = Some(index);
        }

        let index = match found {
            Some(i) if self.entries[i].connected => i,
            _ => {
                if !self.entries.first().is_some_and(|e| e.connected) {
                    return Err(Error::ErrWouldBlock);
                }
                0
            }
        };

        trace!("[{}]: relaying {} bytes to {}", base.log_name(), data.len(), addr);
        self.entries[index].send_to(base, &self.magic_cookie, data, addr, now)?;
        Ok(data.len())
    }

    pub(crate) fn handle_read(&mut self, base: &mut PortBase, socket: SocketId, msg: TaggedBytesMut) {
        let now = msg.now;
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.socket == Some(socket))
        else {
            warn!("[{}]: packet on unknown relay socket {}", base.log_name(), socket);
            return;
        };
        let data = msg.message;

        // without the cookie it is raw data from the locked destination
        if !has_magic_cookie(&data, &self.magic_cookie) {
            let entry = &self.entries[index];
            match entry.ext_addr {
                Some(ext_addr) if entry.locked => base.on_read_packet(data, ext_addr, now),
                _ => warn!("[{}]: dropping packet: entry not locked", base.log_name()),
            }
            return;
        }

        let stun_msg = match Message::unmarshal(&data) {
            Ok(m) => m,
            Err(err) => {
                info!("[{}]: incoming packet was not STUN: {}", base.log_name(), err);
                return;
            }
        };

        if self.entries[index].requests.check_response(&stun_msg, now) {
            self.process_events(base, index, now);
            return;
        }

        match stun_msg.typ {
            SEND_RESPONSE => {
                let mut options = Options::default();
                if options.get_from(&stun_msg).is_ok() && options.is_locked() {
                    debug!("[{}]: relay entry locked", base.log_name());
                    self.entries[index].locked = true;
                }
            }
            DATA_INDICATION => {
                let mut source = MappedAddress::default();
                if let Err(err) = source.get_from_as(&stun_msg, ATTR_SOURCE_ADDRESS2) {
                    info!("[{}]: data indication without source address: {}", base.log_name(), err);
                    return;
                }
                let mut payload = Data::default();
                if let Err(err) = payload.get_from(&stun_msg) {
                    info!("[{}]: data indication without data: {}", base.log_name(), err);
                    return;
                }
                base.on_read_packet(BytesMut::from(&payload.0[..]), source.socket_addr(), now);
            }
            typ => info!("[{}]: received bad STUN type from server: {}", base.log_name(), typ),
        }
    }

    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        self.entries
            .iter_mut()
            .filter_map(|entry| entry.requests.poll_timeout())
            .min()
    }

    pub(crate) fn handle_timeout(&mut self, base: &mut PortBase, now: Instant) {
        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            entry.requests.handle_timeout(now);
            entry.flush(base, now);
            self.process_events(base, index, now);
        }
    }

    pub(crate) fn close(&mut self, base: &mut PortBase) {
        for entry in &mut self.entries {
            entry.requests.clear();
            entry.connected = false;
            entry.local_addr = None;
            if let Some(socket) = entry.socket.take() {
                base.request_socket(SocketRequest::Close { socket });
            }
        }
    }
}
