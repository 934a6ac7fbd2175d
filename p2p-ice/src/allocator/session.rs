use bytes::BytesMut;
use log::{debug, info, warn};
use rand::{Rng, rng};
use shared::error::*;
use shared::{TaggedBytesMut, TimerId, TimerQueue};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun::error_code::ErrorCode;
use stun::message::Message;

use super::*;
use crate::connection::{Connection, ConnectionId};
use crate::port::*;
use crate::socket::{SocketData, SocketEvent, SocketRequest};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionTimer {
    Allocate,
    Step(usize),
    Shake,
}

/// SessionEvent is what a session reports to its owner.
#[derive(Debug)]
pub enum SessionEvent {
    /// A port finished resolving its address.
    PortReady(PortId),
    /// Candidates that may be sent to the remote side now.
    CandidatesReady(Vec<Candidate>),
    ConnectionCreated(ConnectionId),
    ConnectionStateChange(ConnectionId),
    ConnectionDestroyed(ConnectionId),
    /// An authenticated ping arrived on `port` from an address with no
    /// connection. Answer it with [`Session::accept_unknown_address`] or
    /// [`Session::reject_unknown_address`].
    UnknownAddress {
        port: PortId,
        addr: SocketAddr,
        msg: Message,
        remote_username: String,
    },
    /// A connection created in this phase became writable.
    PhaseWritable(Phase),
    PortDestroyed(PortId),
}

/// Application data on a connection.
#[derive(Debug)]
pub struct ConnectionData {
    pub now: Instant,
    pub connection: ConnectionId,
    pub data: BytesMut,
}

#[derive(Debug)]
struct PortData {
    port: Port,
    sequence: usize,
    ready: bool,
}

fn shake_delay() -> Duration {
    let min = SHAKE_MIN_DELAY.as_millis() as u64;
    let max = SHAKE_MAX_DELAY.as_millis() as u64;
    Duration::from_millis(rng().random_range(min..=max))
}

/// Session gathers the ports of one channel across all local networks.
///
/// Right after [`Session::get_initial_ports`] every network runs the phases
/// of its step 0. Once the owner is serious about connecting it calls
/// [`Session::start_get_all_ports`], which runs the remaining phases one step
/// per second and keeps picking up new networks.
#[derive(Debug)]
pub struct Session {
    id: u32,
    name: String,
    generation: u32,
    config: AllocatorConfig,
    port_config: Option<PortConfiguration>,
    networks: Vec<Network>,
    best_writable_phase: Option<Phase>,
    allocation_started: bool,
    running: bool,

    sequences: Vec<AllocationSequence>,
    ports: Vec<PortData>,
    next_port_index: u32,

    timers: TimerQueue<SessionTimer>,
    allocate_timer: Option<TimerId>,
    shake_timer: Option<TimerId>,

    pub(crate) reads: VecDeque<ConnectionData>,
    pub(crate) transmits: VecDeque<TaggedBytesMut>,
    socket_requests: VecDeque<SocketRequest>,
    pub(crate) events: VecDeque<SessionEvent>,
}

impl Session {
    pub(crate) fn new(
        id: u32,
        name: &str,
        config: AllocatorConfig,
        networks: Vec<Network>,
        best_writable_phase: Option<Phase>,
    ) -> Self {
        Self {
            id,
            name: name.to_owned(),
            generation: 0,
            config,
            port_config: None,
            networks,
            best_writable_phase,
            allocation_started: false,
            running: false,
            sequences: vec![],
            ports: vec![],
            next_port_index: 0,
            timers: TimerQueue::new(),
            allocate_timer: None,
            shake_timer: None,
            reads: VecDeque::new(),
            transmits: VecDeque::new(),
            socket_requests: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Generation stamped on the candidates of ports created from now on.
    pub fn set_generation(&mut self, generation: u32) {
        self.generation = generation;
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// New networks get a sequence on the next re-scan.
    pub fn set_networks(&mut self, networks: Vec<Network>) {
        self.networks = networks;
    }

    pub fn best_writable_phase(&self) -> Option<Phase> {
        self.best_writable_phase
    }

    /// Used by sequences created from now on.
    pub fn set_best_writable_phase(&mut self, phase: Option<Phase>) {
        self.best_writable_phase = phase;
    }

    pub fn is_getting_all_ports(&self) -> bool {
        self.running
    }

    pub fn allocation_started(&self) -> bool {
        self.allocation_started
    }

    pub fn port_configuration(&self) -> Option<&PortConfiguration> {
        self.port_config.as_ref()
    }

    pub fn sequences(&self) -> &[AllocationSequence] {
        &self.sequences
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.iter().map(|data| &data.port)
    }

    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.port_index(id).map(|i| &self.ports[i].port)
    }

    /// Whether the port reported its address.
    pub fn port_ready(&self, id: PortId) -> bool {
        self.port_index(id).is_some_and(|i| self.ports[i].ready)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.port(id.port)
            .and_then(|port| port.connection(&id.remote_addr))
    }

    fn port_index(&self, id: PortId) -> Option<usize> {
        self.ports.iter().position(|data| data.port.id() == id)
    }

    /// Snapshots the server configuration and creates the ports of step 0 on
    /// every known network.
    pub fn get_initial_ports(&mut self, now: Instant) {
        if self.port_config.is_some() {
            warn!("[{}]: initial ports already requested", self.log_name());
            return;
        }
        self.port_config = Some(PortConfiguration::from_config(&self.config));
        self.on_allocate(now);

        if self.config.enable_shaker {
            self.shake_timer = Some(self.timers.schedule(now + shake_delay(), SessionTimer::Shake));
        }
    }

    pub fn start_get_all_ports(&mut self, now: Instant) {
        self.running = true;
        if self.allocation_started {
            self.schedule_allocate(now);
        }
        for index in 0..self.sequences.len() {
            self.start_sequence(index, now);
        }
        for index in 0..self.ports.len() {
            self.ports[index].port.start(now);
        }
    }

    pub fn stop_get_all_ports(&mut self) {
        self.running = false;
        if let Some(timer) = self.allocate_timer.take() {
            self.timers.cancel(timer);
        }
        for sequence in &mut self.sequences {
            sequence.set_running(false);
            if let Some(timer) = sequence.timer.take() {
                self.timers.cancel(timer);
            }
        }
    }

    fn log_name(&self) -> String {
        format!("{}-session-{}", self.name, self.id)
    }

    fn schedule_allocate(&mut self, now: Instant) {
        if let Some(timer) = self.allocate_timer.take() {
            self.timers.cancel(timer);
        }
        self.allocate_timer = Some(self.timers.schedule(now + ALLOCATE_DELAY, SessionTimer::Allocate));
    }

    /// Creates a sequence for every network not covered yet.
    fn on_allocate(&mut self, now: Instant) {
        let networks = self.networks.clone();
        for network in networks {
            if self.sequences.iter().any(|seq| seq.is_equivalent(&network)) {
                continue;
            }
            info!("[{}]: allocating on {}", self.log_name(), network);
            self.sequences
                .push(AllocationSequence::new(network, self.best_writable_phase));
            let index = self.sequences.len() - 1;
            self.run_step(index, now);
            if self.running {
                self.start_sequence(index, now);
            }
        }

        self.allocation_started = true;
        if self.running {
            self.schedule_allocate(now);
        }
    }

    fn start_sequence(&mut self, index: usize, now: Instant) {
        let sequence = &mut self.sequences[index];
        sequence.set_running(true);
        if let Some(timer) = sequence.timer.take() {
            self.timers.cancel(timer);
        }
        if sequence.has_pending_phases() {
            sequence.timer = Some(
                self.timers
                    .schedule(now + ALLOCATION_STEP_DELAY, SessionTimer::Step(index)),
            );
        }
    }

    fn run_step(&mut self, index: usize, now: Instant) {
        for phase in self.sequences[index].advance() {
            match phase {
                Phase::Udp => {
                    self.create_udp_port(index, now);
                    self.create_stun_port(index, now);
                    self.enable_protocol(index, ProtocolType::Udp);
                }
                Phase::Relay => self.create_relay_ports(index, now),
                Phase::Tcp => {
                    self.create_tcp_port(index, now);
                    self.enable_protocol(index, ProtocolType::Tcp);
                }
                Phase::SslTcp => self.enable_protocol(index, ProtocolType::SslTcp),
            }
        }

        let sequence = &mut self.sequences[index];
        if sequence.running() && sequence.has_pending_phases() {
            sequence.timer = Some(
                self.timers
                    .schedule(now + ALLOCATION_STEP_DELAY, SessionTimer::Step(index)),
            );
        }
    }

    fn enable_protocol(&mut self, sequence: usize, protocol: ProtocolType) {
        if !self.sequences[sequence].enable_protocol(protocol) {
            return;
        }
        let candidates: Vec<Candidate> = self
            .ports
            .iter()
            .filter(|data| data.ready && data.sequence == sequence)
            .flat_map(|data| data.port.candidates())
            .filter(|c| c.protocol() == protocol)
            .cloned()
            .collect();
        if !candidates.is_empty() {
            self.events
                .push_back(SessionEvent::CandidatesReady(candidates));
        }
    }

    fn create_udp_port(&mut self, sequence: usize, now: Instant) {
        if self.config.disable_udp {
            return;
        }
        let local_addr = SocketAddr::new(self.sequences[sequence].network().ip(), 0);
        let kind = PortKind::Udp(UdpPort::new(local_addr));
        let index = self.add_allocated_port(sequence, CandidateType::Local, kind, PREF_LOCAL_UDP, now);
        self.prepare_port(index, now);
    }

    fn create_stun_port(&mut self, sequence: usize, now: Instant) {
        if self.config.disable_stun {
            return;
        }
        let Some(server_addr) = self.port_config.as_ref().and_then(|c| c.stun_address) else {
            return;
        };
        let local_addr = SocketAddr::new(self.sequences[sequence].network().ip(), 0);
        let kind = PortKind::Stun(StunPort::new(local_addr, server_addr));
        let index = self.add_allocated_port(sequence, CandidateType::Stun, kind, PREF_LOCAL_STUN, now);
        self.prepare_port(index, now);
    }

    fn create_tcp_port(&mut self, sequence: usize, now: Instant) {
        if self.config.disable_tcp {
            return;
        }
        let local_addr = SocketAddr::new(self.sequences[sequence].network().ip(), 0);
        let kind = PortKind::Tcp(TcpPort::new(local_addr));
        let index = self.add_allocated_port(sequence, CandidateType::Local, kind, PREF_LOCAL_TCP, now);
        self.prepare_port(index, now);
    }

    fn create_relay_ports(&mut self, sequence: usize, now: Instant) {
        if self.config.disable_relay {
            return;
        }
        let Some(port_config) = self.port_config.clone() else {
            return;
        };
        let ip = self.sequences[sequence].network().ip();
        for relay in &port_config.relays {
            let kind = PortKind::Relay(RelayPort::new(ip, port_config.magic_cookie.clone()));
            let index = self.add_allocated_port(
                sequence,
                CandidateType::Relay,
                kind,
                PREF_RELAY + relay.pref_modifier,
                now,
            );
            // candidates of the server addresses need the name and preference
            // set above
            let port = &mut self.ports[index].port;
            port.set_credentials(port_config.username.clone(), port_config.password.clone());
            for addr in &relay.ports {
                port.add_relay_server(*addr);
            }
            self.prepare_port(index, now);
        }
    }

    fn add_allocated_port(
        &mut self,
        sequence: usize,
        port_type: CandidateType,
        kind: PortKind,
        preference: f32,
        now: Instant,
    ) -> usize {
        let id = PortId {
            session: self.id,
            index: self.next_port_index,
        };
        self.next_port_index += 1;

        let network = self.sequences[sequence].network().clone();
        let mut port = Port::new(PortBase::new(id, port_type, network), kind);
        port.set_name(&self.name);
        port.set_preference(preference);
        port.set_generation(self.generation);
        port.set_proxy(&self.config.user_agent, self.config.proxy.clone());
        if self.running {
            port.start(now);
        }
        debug!("[{}]: adding {}", self.log_name(), port);

        self.ports.push(PortData {
            port,
            sequence,
            ready: false,
        });
        self.ports.len() - 1
    }

    fn prepare_port(&mut self, index: usize, now: Instant) {
        self.ports[index].port.prepare_address(now);
        self.process_port(index, now);
    }

    /// Moves the port's output into the session queues and reacts to its
    /// events. A destroyed port is removed.
    fn process_port(&mut self, index: usize, now: Instant) {
        let data = &mut self.ports[index];
        while let Some(transmit) = data.port.poll_transmit() {
            self.transmits.push_back(transmit);
        }
        while let Some(request) = data.port.poll_socket_request() {
            self.socket_requests.push_back(request);
        }
        let mut port_events = vec![];
        while let Some(event) = data.port.poll_event() {
            port_events.push(event);
        }

        let port_id = data.port.id();
        let mut destroyed = false;
        for event in port_events {
            match event {
                PortEvent::AddressReady => self.on_address_ready(index),
                PortEvent::ConnectionCreated(id) => {
                    self.events.push_back(SessionEvent::ConnectionCreated(id))
                }
                PortEvent::ConnectionStateChange(id) => self.on_connection_state_change(index, id),
                PortEvent::ConnectionDestroyed(id) => {
                    self.events.push_back(SessionEvent::ConnectionDestroyed(id))
                }
                PortEvent::UnknownAddress {
                    addr,
                    msg,
                    remote_username,
                } => self.events.push_back(SessionEvent::UnknownAddress {
                    port: port_id,
                    addr,
                    msg,
                    remote_username,
                }),
                PortEvent::ReadPacket { connection, data } => {
                    self.reads.push_back(ConnectionData {
                        now,
                        connection,
                        data,
                    })
                }
                PortEvent::Destroyed => destroyed = true,
            }
        }

        if destroyed {
            self.ports.remove(index);
            info!(
                "[{}]: removed port {} from allocator: {} remaining",
                self.log_name(),
                port_id,
                self.ports.len()
            );
            self.events.push_back(SessionEvent::PortDestroyed(port_id));
        }
    }

    fn on_address_ready(&mut self, index: usize) {
        let log_name = self.log_name();
        let data = &mut self.ports[index];
        if data.ready {
            warn!("[{}]: {} reported its address twice", log_name, data.port);
            return;
        }
        data.ready = true;
        self.events
            .push_back(SessionEvent::PortReady(data.port.id()));

        // only the candidates whose protocol has been enabled
        let sequence = &self.sequences[data.sequence];
        let candidates: Vec<Candidate> = data
            .port
            .candidates()
            .iter()
            .filter(|c| sequence.protocol_enabled(c.protocol()))
            .cloned()
            .collect();
        if !candidates.is_empty() {
            self.events
                .push_back(SessionEvent::CandidatesReady(candidates));
        }
    }

    fn on_connection_state_change(&mut self, index: usize, id: ConnectionId) {
        let port = &self.ports[index].port;
        if let Some(conn) = port.connection(&id.remote_addr) {
            if conn.writable() {
                if let Some(local) = port.candidates().get(conn.local_candidate_index()) {
                    self.events
                        .push_back(SessionEvent::PhaseWritable(local_candidate_to_phase(local)));
                }
            }
        }
        self.events
            .push_back(SessionEvent::ConnectionStateChange(id));
    }

    /// Destroys every connection of the ready ports.
    fn on_shake(&mut self, now: Instant) {
        let mut ports = 0;
        let mut connections = 0;
        let ready: Vec<PortId> = self
            .ports
            .iter()
            .filter(|data| data.ready)
            .map(|data| data.port.id())
            .collect();
        for id in ready {
            if let Some(index) = self.port_index(id) {
                ports += 1;
                connections += self.ports[index].port.connections().count();
                self.ports[index].port.destroy_connections(now);
                self.process_port(index, now);
            }
        }
        info!(
            "[{}]: shake destroyed the connections of {} ports: {} connections",
            self.log_name(),
            ports,
            connections
        );

        if self.running || ports > 0 || connections > 0 {
            self.shake_timer = Some(self.timers.schedule(now + shake_delay(), SessionTimer::Shake));
        }
    }

    /// Runs `f` on the port with `id` and processes its output.
    fn with_port<T>(
        &mut self,
        id: PortId,
        now: Instant,
        f: impl FnOnce(&mut Port) -> Result<T>,
    ) -> Result<T> {
        let index = self.port_index(id).ok_or(Error::ErrPortNotFound)?;
        let result = f(&mut self.ports[index].port);
        self.process_port(index, now);
        result
    }

    /// Creates a connection from the port to `remote`. None when the port
    /// can't reach it or already has a connection to its address.
    pub fn create_connection(
        &mut self,
        port: PortId,
        remote: &Candidate,
        origin: CandidateOrigin,
        now: Instant,
    ) -> Option<ConnectionId> {
        self.with_port(port, now, |p| Ok(p.create_connection(remote, origin, now)))
            .ok()
            .flatten()
    }

    pub fn received_ping(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_port(id.port, now, |p| {
            p.received_ping(id.remote_addr, now);
            Ok(())
        })
    }

    pub fn ping(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_port(id.port, now, |p| p.ping(id.remote_addr, now))
    }

    pub fn send(&mut self, id: ConnectionId, data: &[u8], now: Instant) -> Result<usize> {
        self.with_port(id.port, now, |p| p.send(id.remote_addr, data, now))
    }

    pub fn update_connection_state(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_port(id.port, now, |p| {
            p.update_connection_state(id.remote_addr, now);
            Ok(())
        })
    }

    pub fn prune_connection(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_port(id.port, now, |p| {
            p.prune_connection(id.remote_addr, now);
            Ok(())
        })
    }

    pub fn destroy_connection(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        self.with_port(id.port, now, |p| {
            p.destroy_connection(id.remote_addr, now);
            Ok(())
        })
    }

    /// Answers a ping reported by [`SessionEvent::UnknownAddress`] once a
    /// connection to `addr` exists.
    pub fn accept_unknown_address(
        &mut self,
        port: PortId,
        msg: &Message,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<()> {
        self.with_port(port, now, |p| {
            p.send_binding_response(msg, addr, now);
            Ok(())
        })
    }

    /// Rejects a ping reported by [`SessionEvent::UnknownAddress`].
    pub fn reject_unknown_address(
        &mut self,
        port: PortId,
        msg: &Message,
        addr: SocketAddr,
        code: ErrorCode,
        now: Instant,
    ) -> Result<()> {
        self.with_port(port, now, |p| {
            p.send_binding_error_response(msg, addr, code, now);
            Ok(())
        })
    }

    pub(crate) fn handle_socket_data(&mut self, input: SocketData) -> Result<()> {
        let SocketData { socket, msg } = input;
        let now = msg.now;
        let Some(index) = self.port_index(socket.port) else {
            warn!(
                "[{}]: discarded {} bytes on socket {} of no port",
                self.log_name(),
                msg.message.len(),
                socket
            );
            return Err(Error::ErrPortNotFound);
        };
        self.ports[index].port.handle_read(socket, msg);
        self.process_port(index, now);
        Ok(())
    }

    pub(crate) fn handle_socket_event(&mut self, event: SocketEvent, now: Instant) -> Result<()> {
        let socket = event.socket();
        let Some(index) = self.port_index(socket.port) else {
            debug!("[{}]: {:?} for socket of no port", self.log_name(), event);
            return Err(Error::ErrPortNotFound);
        };
        self.ports[index].port.handle_socket_event(event, now);
        self.process_port(index, now);
        Ok(())
    }

    pub fn poll_socket_request(&mut self) -> Option<SocketRequest> {
        self.socket_requests.pop_front()
    }

    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        let mut deadline = self.timers.poll_timeout();
        for data in &mut self.ports {
            if let Some(t) = data.port.poll_timeout() {
                deadline = Some(deadline.map_or(t, |d| d.min(t)));
            }
        }
        deadline
    }

    pub(crate) fn on_timeout(&mut self, now: Instant) {
        let due: Vec<PortId> = self
            .ports
            .iter_mut()
            .filter_map(|data| match data.port.poll_timeout() {
                Some(t) if t <= now => Some(data.port.id()),
                _ => None,
            })
            .collect();
        for id in due {
            if let Some(index) = self.port_index(id) {
                self.ports[index].port.handle_timeout(now);
                self.process_port(index, now);
            }
        }

        while let Some(timer) = self.timers.pop_expired(now) {
            match timer {
                SessionTimer::Allocate => {
                    self.allocate_timer = None;
                    self.on_allocate(now);
                }
                SessionTimer::Step(index) => {
                    self.sequences[index].timer = None;
                    self.run_step(index, now);
                }
                SessionTimer::Shake => {
                    self.shake_timer = None;
                    self.on_shake(now);
                }
            }
        }
    }

    /// Closes every port and stops all scheduling.
    pub(crate) fn shutdown(&mut self) {
        self.stop_get_all_ports();
        self.timers.clear();
        self.shake_timer = None;
        for data in &mut self.ports {
            data.port.close();
            while let Some(request) = data.port.poll_socket_request() {
                self.socket_requests.push_back(request);
            }
        }
        self.ports.clear();
    }
}
