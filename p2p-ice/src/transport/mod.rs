#[cfg(test)]
mod transport_test;

pub mod transport_config;
mod transport_proto;

use bytes::BytesMut;
use log::{debug, info, warn};
use sansio::Protocol;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun::error_code::{CODE_SERVER_ERROR, CODE_STALE_CREDENTIALS};
use stun::message::Message;

use crate::allocator::session::ConnectionData;
use crate::allocator::{BasicPortAllocator, Session, SessionEvent};
use crate::candidate::Candidate;
use crate::connection::{Connection, ConnectionId, ReadState, WriteState};
use crate::network::Network;
use crate::port::{CandidateOrigin, PortId};
use crate::socket::{SocketData, SocketEvent, SocketNotice, SocketRequest};
use shared::error::*;
use shared::{TaggedBytesMut, TimerId, TimerQueue};
pub use transport_config::TransportConfig;
use transport_config::*;

/// Whether the transport has a writable path to the remote side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Writable,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            TransportState::Connecting => "connecting",
            TransportState::Writable => "writable",
        };
        write!(f, "{s}")
    }
}

/// TransportEvent is what a transport reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    StateChange(TransportState),
    /// Local candidates to signal to the remote side.
    CandidatesReady(Vec<Candidate>),
    /// The transport needs to signal a new set of candidates. Call
    /// [`Transport::on_signaling_ready`] once the signaling channel is up.
    RequestSignaling,
    /// Data now goes to this remote address.
    BestConnectionChanged(SocketAddr),
}

/// Application data on the best path.
#[derive(Debug)]
pub struct Packet {
    pub now: Instant,
    pub data: BytesMut,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum TransportTimer {
    Ping,
    Allocate,
}

#[derive(Debug, Clone)]
struct RemoteCandidate {
    candidate: Candidate,
    origin_port: Option<PortId>,
}

/// What a connection is ranked by, read out of its port.
#[derive(Debug, Clone)]
struct Ranking {
    id: ConnectionId,
    write_state: WriteState,
    read_state: ReadState,
    connected: bool,
    preference: f64,
    rtt: Duration,
    last_ping_sent: Option<Instant>,
    network: Network,
}

/// Compares the candidates only; Greater means `a` is preferred.
fn compare_connection_candidates(a: &Ranking, b: &Ranking) -> Ordering {
    a.preference
        .partial_cmp(&b.preference)
        .unwrap_or(Ordering::Equal)
}

/// Compares writability first, then candidates; Greater means `a` is
/// preferred.
fn compare_connections(a: &Ranking, b: &Ranking) -> Ordering {
    b.write_state
        .cmp(&a.write_state)
        .then_with(|| compare_connection_candidates(a, b))
}

/// Whether to switch from the best connection `a` to `b`: on preference
/// first, then on round trip time.
fn should_switch(a: Option<&Ranking>, b: Option<&Ranking>) -> bool {
    let (a, b) = match (a, b) {
        (None, None) => return false,
        (Some(a), Some(b)) => (a, b),
        _ => return true,
    };
    if a.id == b.id {
        return false;
    }
    match compare_connections(a, b) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => b.rtt <= a.rtt + MIN_RTT_IMPROVEMENT,
    }
}

/// Transport is one channel between two peers. It runs allocator sessions,
/// pairs their ports with the remote candidates, pings the connections and
/// sends data over the best one.
pub struct Transport {
    name: String,
    allocator: BasicPortAllocator,
    sessions: Vec<Session>,
    /// Ready ports of the latest session; new remote candidates go to these.
    ports: Vec<PortId>,
    /// Best first after each sort.
    connections: Vec<ConnectionId>,
    remote_candidates: Vec<RemoteCandidate>,
    best_connection: Option<ConnectionId>,

    state: TransportState,
    waiting_for_signaling: bool,
    pinging_started: bool,
    sort_dirty: bool,
    was_writable: bool,
    was_timed_out: bool,

    writable_ping_interval: Duration,
    unwritable_ping_interval: Duration,
    max_current_writable_delay: Duration,
    allocate_period: Duration,

    timers: TimerQueue<TransportTimer>,
    ping_timer: Option<TimerId>,
    allocate_timer: Option<TimerId>,

    reads: VecDeque<Packet>,
    transmits: VecDeque<TaggedBytesMut>,
    socket_requests: VecDeque<SocketRequest>,
    events: VecDeque<TransportEvent>,
}

impl Transport {
    /// Creates a transport for the channel `name` that gathers its ports with
    /// `allocator`.
    pub fn new(name: &str, allocator: BasicPortAllocator, config: TransportConfig) -> Self {
        Self {
            name: name.to_owned(),
            allocator,
            sessions: vec![],
            ports: vec![],
            connections: vec![],
            remote_candidates: vec![],
            best_connection: None,
            state: TransportState::Connecting,
            waiting_for_signaling: false,
            pinging_started: false,
            sort_dirty: false,
            was_writable: false,
            // no new allocation while the first one builds up
            was_timed_out: true,
            writable_ping_interval: config.writable_ping_interval.unwrap_or(WRITABLE_PING_DELAY),
            unwritable_ping_interval: config
                .unwritable_ping_interval
                .unwrap_or(UNWRITABLE_PING_DELAY),
            max_current_writable_delay: config
                .max_current_writable_delay
                .unwrap_or(MAX_CURRENT_WRITABLE_DELAY),
            allocate_period: config.allocate_period.unwrap_or(ALLOCATE_PERIOD),
            timers: TimerQueue::new(),
            ping_timer: None,
            allocate_timer: None,
            reads: VecDeque::new(),
            transmits: VecDeque::new(),
            socket_requests: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn allocator(&self) -> &BasicPortAllocator {
        &self.allocator
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Whether the best connection is writable.
    pub fn writable(&self) -> bool {
        self.best_connection()
            .is_some_and(|conn| conn.write_state() == WriteState::Writable)
    }

    pub fn best_connection(&self) -> Option<&Connection> {
        self.best_connection.and_then(|id| self.connection(id))
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.session(id.port.session)
            .and_then(|session| session.connection(id))
    }

    /// Connections, best first as of the last sort.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().filter_map(|id| self.connection(*id))
    }

    pub fn remote_candidates(&self) -> impl Iterator<Item = &Candidate> {
        self.remote_candidates.iter().map(|rc| &rc.candidate)
    }

    /// Hands a fresh network enumeration to the allocator and its sessions.
    pub fn set_networks(&mut self, networks: Vec<Network>) {
        for session in &mut self.sessions {
            session.set_networks(networks.clone());
        }
        self.allocator.set_networks(networks);
    }

    pub fn poll_socket_request(&mut self) -> Option<SocketRequest> {
        self.socket_requests.pop_front()
    }

    /// Asks for signaling to start the first allocation and starts pinging.
    pub fn start_processing_candidates(&mut self, now: Instant) {
        self.on_allocate();
        self.schedule_ping(now);
    }

    /// Drops every session, connection and remote candidate, and starts over.
    pub fn reset(&mut self, now: Instant) {
        self.close_sessions();
        self.ports.clear();
        self.connections.clear();
        self.best_connection = None;
        self.remote_candidates.clear();
        self.set_state(TransportState::Connecting);

        self.waiting_for_signaling = false;
        self.pinging_started = false;
        self.sort_dirty = false;
        self.was_writable = false;
        self.was_timed_out = true;

        self.timers.clear();
        self.allocate_timer = None;
        self.ping_timer = None;
        self.start_processing_candidates(now);
    }

    /// Starts the allocation requested with [`TransportEvent::RequestSignaling`].
    pub fn on_signaling_ready(&mut self, now: Instant) {
        if !self.waiting_for_signaling {
            return;
        }
        self.waiting_for_signaling = false;
        let session = self.allocator.create_session(&self.name);
        self.add_allocator_session(session, now);

        if let Some(timer) = self.allocate_timer.take() {
            self.timers.cancel(timer);
        }
        self.allocate_timer = Some(
            self.timers
                .schedule(now + self.allocate_period, TransportTimer::Allocate),
        );
        self.process_sessions(now);
    }

    /// Pairs the signaled remote candidates with every ready port.
    pub fn add_remote_candidates(&mut self, candidates: &[Candidate], now: Instant) {
        for candidate in candidates {
            self.create_connections(candidate, None, false, now);
        }
        self.sort_connections(now);
        self.process_sessions(now);
    }

    /// Sends over the best connection.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<usize> {
        let id = self.best_connection.ok_or(Error::ErrWouldBlock)?;
        let index = self
            .session_index(id.port.session)
            .ok_or(Error::ErrPortNotFound)?;
        let result = self.sessions[index].send(id, data, now);
        self.process_sessions(now);
        result
    }

    fn session(&self, id: u32) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id() == id)
    }

    fn session_index(&self, id: u32) -> Option<usize> {
        self.sessions.iter().position(|session| session.id() == id)
    }

    fn add_allocator_session(&mut self, mut session: Session, now: Instant) {
        session.set_generation(self.sessions.len() as u32);
        info!(
            "[{}]: new allocator session {} generation {}",
            self.name,
            session.id(),
            session.generation()
        );
        // new remote candidates only go to the ports of the newest session
        self.ports.clear();

        session.get_initial_ports(now);
        if self.pinging_started {
            session.start_get_all_ports(now);
        }
        self.sessions.push(session);
    }

    fn set_state(&mut self, state: TransportState) {
        if self.state != state {
            debug!("[{}]: state {} -> {}", self.name, self.state, state);
            self.state = state;
            self.events.push_back(TransportEvent::StateChange(state));
        }
    }

    fn on_allocate(&mut self) {
        self.waiting_for_signaling = true;
        self.events.push_back(TransportEvent::RequestSignaling);
    }

    fn schedule_ping(&mut self, deadline: Instant) {
        if let Some(timer) = self.ping_timer.take() {
            self.timers.cancel(timer);
        }
        self.ping_timer = Some(self.timers.schedule(deadline, TransportTimer::Ping));
    }

    fn request_sort(&mut self) {
        self.sort_dirty = true;
    }

    /// Moves the output of every session into the transport queues and
    /// handles session events until none are left, sorting as requested.
    fn process_sessions(&mut self, now: Instant) {
        loop {
            let mut pending = vec![];
            for session in &mut self.sessions {
                while let Some(transmit) = session.poll_write() {
                    self.transmits.push_back(transmit);
                }
                while let Some(request) = session.poll_socket_request() {
                    self.socket_requests.push_back(request);
                }
                while let Some(ConnectionData { now, data, .. }) = session.poll_read() {
                    self.reads.push_back(Packet { now, data });
                }
                while let Some(event) = session.poll_event() {
                    pending.push(event);
                }
            }

            if pending.is_empty() {
                if !self.sort_dirty {
                    break;
                }
                self.sort_connections(now);
                continue;
            }
            for event in pending {
                self.on_session_event(event, now);
            }
        }
    }

    fn on_session_event(&mut self, event: SessionEvent, now: Instant) {
        match event {
            SessionEvent::PortReady(port) => self.on_port_ready(port, now),
            SessionEvent::CandidatesReady(candidates) => {
                self.events
                    .push_back(TransportEvent::CandidatesReady(candidates));
            }
            SessionEvent::ConnectionCreated(id) => {
                debug!("[{}]: connection {} created", self.name, id);
            }
            SessionEvent::ConnectionStateChange(_) => self.request_sort(),
            SessionEvent::ConnectionDestroyed(id) => self.on_connection_destroyed(id),
            SessionEvent::UnknownAddress {
                port,
                addr,
                msg,
                remote_username,
            } => self.on_unknown_address(port, addr, msg, &remote_username, now),
            SessionEvent::PhaseWritable(phase) => {
                self.allocator.add_writable_phase(phase);
                let best = self.allocator.best_writable_phase();
                for session in &mut self.sessions {
                    session.set_best_writable_phase(best);
                }
            }
            SessionEvent::PortDestroyed(port) => {
                self.ports.retain(|p| *p != port);
                info!(
                    "[{}]: removed port {}: {} remaining",
                    self.name,
                    port,
                    self.ports.len()
                );
            }
        }
    }

    fn on_port_ready(&mut self, port: PortId, now: Instant) {
        // ports of older sessions no longer take new candidates
        if self
            .sessions
            .last()
            .is_none_or(|session| session.id() != port.session)
        {
            return;
        }
        self.ports.push(port);
        let remotes = self.remote_candidates.clone();
        for remote in remotes {
            self.create_connection(port, &remote.candidate, remote.origin_port, false, now);
        }
        self.request_sort();
    }

    fn on_connection_destroyed(&mut self, id: ConnectionId) {
        self.connections.retain(|c| *c != id);
        info!(
            "[{}]: removed connection {}: {} remaining",
            self.name,
            id,
            self.connections.len()
        );
        if self.best_connection == Some(id) {
            self.best_connection = None;
            self.request_sort();
        }
    }

    /// A ping with a known remote username arrived from a new address; the
    /// address becomes a remote candidate of its own.
    fn on_unknown_address(
        &mut self,
        port: PortId,
        addr: SocketAddr,
        msg: Message,
        remote_username: &str,
        now: Instant,
    ) {
        let Some(index) = self.session_index(port.session) else {
            return;
        };
        let candidate = self
            .remote_candidates
            .iter()
            .find(|rc| rc.candidate.username() == remote_username)
            .map(|rc| rc.candidate.with_address(addr));
        let Some(candidate) = candidate else {
            // an answer may beat the candidates through signaling; the remote
            // side retries
            debug!(
                "[{}]: ping from {} with unknown username {}",
                self.name, addr, remote_username
            );
            if let Err(err) = self.sessions[index].reject_unknown_address(
                port,
                &msg,
                addr,
                CODE_STALE_CREDENTIALS,
                now,
            ) {
                warn!("[{}]: failed to reject {}: {}", self.name, addr, err);
            }
            return;
        };

        if self.create_connections(&candidate, Some(port), true, now) {
            if let Some(index) = self.session_index(port.session) {
                if let Err(err) = self.sessions[index].accept_unknown_address(port, &msg, addr, now) {
                    warn!("[{}]: failed to answer {}: {}", self.name, addr, err);
                }
            }
            self.request_sort();
        } else if let Some(index) = self.session_index(port.session) {
            warn!("[{}]: no connection from {} to {}", self.name, port, addr);
            if let Err(err) =
                self.sessions[index].reject_unknown_address(port, &msg, addr, CODE_SERVER_ERROR, now)
            {
                warn!("[{}]: failed to reject {}: {}", self.name, addr, err);
            }
        }
    }

    /// Creates connections to `remote` from every ready port and the origin
    /// port. Returns true if the origin port got one.
    fn create_connections(
        &mut self,
        remote: &Candidate,
        origin_port: Option<PortId>,
        readable: bool,
        now: Instant,
    ) -> bool {
        let mut created = false;
        let ports = self.ports.clone();
        for port in ports.iter().rev() {
            if self.create_connection(*port, remote, origin_port, readable, now)
                && Some(*port) == origin_port
            {
                created = true;
            }
        }
        // the origin port may be the only one able to reach the address
        if let Some(origin) = origin_port {
            if !ports.contains(&origin)
                && self.create_connection(origin, remote, origin_port, readable, now)
            {
                created = true;
            }
        }

        self.remember_remote_candidate(remote, origin_port, now);
        created
    }

    fn create_connection(
        &mut self,
        port: PortId,
        remote: &Candidate,
        origin_port: Option<PortId>,
        readable: bool,
        now: Instant,
    ) -> bool {
        let Some(index) = self.session_index(port.session) else {
            return false;
        };
        let session = &mut self.sessions[index];
        let Some(existing) = session.port(port) else {
            return false;
        };

        let id = match existing.connection(&remote.address()) {
            Some(conn) => {
                // the remote side may send a duplicate, never a change
                if !remote.is_equivalent(conn.remote_candidate()) {
                    info!(
                        "[{}]: attempt to change remote candidate {}",
                        self.name,
                        remote.address()
                    );
                    return false;
                }
                conn.id()
            }
            None => {
                let origin = match origin_port {
                    None => CandidateOrigin::Message,
                    Some(origin) if origin == port => CandidateOrigin::ThisPort,
                    Some(_) => CandidateOrigin::OtherPort,
                };
                let Some(id) = session.create_connection(port, remote, origin, now) else {
                    return false;
                };
                self.connections.push(id);
                id
            }
        };

        if readable {
            if let Err(err) = self.sessions[index].received_ping(id, now) {
                warn!("[{}]: failed to mark {} readable: {}", self.name, id, err);
            }
        }
        true
    }

    /// Keeps `remote` for ports that become ready later. A newer generation
    /// replaces the older ones.
    fn remember_remote_candidate(
        &mut self,
        remote: &Candidate,
        origin_port: Option<PortId>,
        now: Instant,
    ) {
        self.remote_candidates.retain(|rc| {
            let keep = rc.candidate.generation() >= remote.generation();
            if !keep {
                info!(
                    "[{}]: pruning candidate from old generation: {}",
                    self.name,
                    rc.candidate.address()
                );
            }
            keep
        });

        if self
            .remote_candidates
            .iter()
            .any(|rc| rc.candidate.is_equivalent(remote))
        {
            debug!("[{}]: duplicate candidate {}", self.name, remote.address());
            return;
        }
        self.remote_candidates.push(RemoteCandidate {
            candidate: remote.clone(),
            origin_port,
        });

        // the remote side is there, so get serious about connecting
        if !self.pinging_started {
            self.pinging_started = true;
            for session in &mut self.sessions {
                if !session.is_getting_all_ports() {
                    session.start_get_all_ports(now);
                }
            }
        }
    }

    fn ranking(&self, id: ConnectionId) -> Option<Ranking> {
        let port = self.session(id.port.session)?.port(id.port)?;
        let conn = port.connection(&id.remote_addr)?;
        let local = port.candidates().get(conn.local_candidate_index())?;
        Some(Ranking {
            id,
            write_state: conn.write_state(),
            read_state: conn.read_state(),
            connected: conn.connected(),
            preference: f64::from(local.preference())
                * f64::from(conn.remote_candidate().preference()),
            rtt: conn.rtt(),
            last_ping_sent: conn.last_ping_sent(),
            network: port.network().clone(),
        })
    }

    fn update_connection_states(&mut self, now: Instant) {
        for id in self.connections.clone() {
            if let Some(index) = self.session_index(id.port.session) {
                if let Err(err) = self.sessions[index].update_connection_state(id, now) {
                    warn!("[{}]: failed to update {}: {}", self.name, id, err);
                }
            }
        }
    }

    /// Sorts the connections best first, switches the best connection if
    /// worthwhile, prunes connections made redundant by a writable one and
    /// updates the transport state.
    fn sort_connections(&mut self, now: Instant) {
        self.update_connection_states(now);
        self.sort_dirty = false;

        let mut rankings: Vec<Ranking> = self
            .connections
            .iter()
            .filter_map(|id| self.ranking(*id))
            .collect();
        // stable, so equal connections keep their order
        rankings.sort_by(|a, b| {
            compare_connections(b, a).then_with(|| a.rtt.cmp(&b.rtt))
        });
        self.connections = rankings.iter().map(|r| r.id).collect();

        let best = self
            .best_connection
            .and_then(|id| rankings.iter().find(|r| r.id == id));
        let top = rankings.first();
        if should_switch(best, top) {
            let top = top.map(|r| r.id);
            self.switch_best_connection_to(top);
        }

        // on each network, prune what a writable premier beats or ties;
        // better ones may still become writable
        let mut networks: Vec<&Network> = vec![];
        for r in &rankings {
            if !networks.contains(&&r.network) {
                networks.push(&r.network);
            }
        }
        let mut prune = vec![];
        for network in networks {
            let premier = self
                .best_connection
                .and_then(|id| rankings.iter().find(|r| r.id == id && r.network == *network))
                .or_else(|| rankings.iter().find(|r| r.network == *network));
            let Some(premier) = premier else {
                continue;
            };
            if premier.write_state != WriteState::Writable {
                continue;
            }
            for r in &rankings {
                if r.id != premier.id
                    && r.network == *network
                    && compare_connection_candidates(premier, r) != Ordering::Less
                {
                    prune.push(r.id);
                }
            }
        }
        for id in prune {
            if let Some(index) = self.session_index(id.port.session) {
                if let Err(err) = self.sessions[index].prune_connection(id, now) {
                    warn!("[{}]: failed to prune {}: {}", self.name, id, err);
                }
            }
        }

        let writable = rankings
            .iter()
            .any(|r| r.write_state == WriteState::Writable);
        let write_connect = rankings
            .iter()
            .any(|r| r.write_state == WriteState::WriteConnect);
        if writable {
            self.handle_writable();
        } else if write_connect {
            self.handle_not_writable();
        } else {
            self.handle_all_timed_out();
        }
    }

    fn switch_best_connection_to(&mut self, id: Option<ConnectionId>) {
        self.best_connection = id;
        if let Some(id) = id {
            info!("[{}]: best connection is now {}", self.name, id);
            self.events
                .push_back(TransportEvent::BestConnectionChanged(id.remote_addr));
        }
    }

    /// Some connection is writable: stop gathering.
    fn handle_writable(&mut self) {
        if self.state != TransportState::Writable {
            for session in &mut self.sessions {
                if session.is_getting_all_ports() {
                    session.stop_get_all_ports();
                }
            }
            if let Some(timer) = self.allocate_timer.take() {
                self.timers.cancel(timer);
            }
        }
        self.was_writable = true;
        self.was_timed_out = false;
        self.set_state(TransportState::Writable);
    }

    /// Nothing is writable but some connection is still trying. Losing
    /// writability asks for a new allocation right away.
    fn handle_not_writable(&mut self) {
        if self.was_writable {
            self.was_writable = false;
            self.on_allocate();
        }
        self.was_timed_out = false;
        self.set_state(TransportState::Connecting);
    }

    fn handle_all_timed_out(&mut self) {
        if !self.was_timed_out {
            self.on_allocate();
        }
        self.was_timed_out = true;
        self.was_writable = false;
        self.set_state(TransportState::Connecting);
    }

    fn is_pingable(&self, r: &Ranking) -> bool {
        if !r.connected {
            return false;
        }
        if self.state == TransportState::Writable {
            // only what could beat the current path
            r.write_state != WriteState::WriteTimeout
        } else {
            // a pruned connection the remote side still pings may work
            r.write_state != WriteState::WriteTimeout || r.read_state != ReadState::ReadTimeout
        }
    }

    /// The best connection if it is writable and due, otherwise the pingable
    /// connection pinged least recently.
    fn find_next_pingable_connection(&self, now: Instant) -> Option<ConnectionId> {
        if let Some(best) = self.best_connection.and_then(|id| self.ranking(id)) {
            if best.write_state == WriteState::Writable
                && best
                    .last_ping_sent
                    .is_none_or(|t| t + self.max_current_writable_delay <= now)
            {
                return Some(best.id);
            }
        }

        self.connections
            .iter()
            .filter_map(|id| self.ranking(*id))
            .filter(|r| self.is_pingable(r))
            .min_by_key(|r| r.last_ping_sent)
            .map(|r| r.id)
    }

    fn on_ping(&mut self, now: Instant) {
        self.update_connection_states(now);

        if let Some(id) = self.find_next_pingable_connection(now) {
            if let Some(index) = self.session_index(id.port.session) {
                if let Err(err) = self.sessions[index].ping(id, now) {
                    debug!("[{}]: failed to ping {}: {}", self.name, id, err);
                }
            }
        }

        let delay = if self.state == TransportState::Writable {
            self.writable_ping_interval
        } else {
            self.unwritable_ping_interval
        };
        self.schedule_ping(now + delay);
    }

    pub(crate) fn handle_socket_data(&mut self, input: SocketData) -> Result<()> {
        let now = input.msg.now;
        let index = self
            .session_index(input.socket.port.session)
            .ok_or(Error::ErrPortNotFound)?;
        let result = self.sessions[index].handle_read(input);
        self.process_sessions(now);
        result
    }

    pub(crate) fn handle_socket_event(&mut self, event: SocketEvent, now: Instant) -> Result<()> {
        let index = self
            .session_index(event.socket().port.session)
            .ok_or(Error::ErrPortNotFound)?;
        let result = self.sessions[index].handle_event(SocketNotice { now, event });
        self.process_sessions(now);
        result
    }

    pub(crate) fn next_timeout(&mut self) -> Option<Instant> {
        let mut deadline = self.timers.poll_timeout();
        for session in &mut self.sessions {
            if let Some(t) = session.poll_timeout() {
                deadline = Some(deadline.map_or(t, |d| d.min(t)));
            }
        }
        deadline
    }

    pub(crate) fn on_timeout(&mut self, now: Instant) {
        for session in &mut self.sessions {
            if session.poll_timeout().is_some_and(|t| t <= now) {
                if let Err(err) = session.handle_timeout(now) {
                    warn!("[{}]: session {} timeout: {}", self.name, session.id(), err);
                }
            }
        }
        self.process_sessions(now);

        while let Some(timer) = self.timers.pop_expired(now) {
            match timer {
                TransportTimer::Ping => {
                    self.ping_timer = None;
                    self.on_ping(now);
                }
                TransportTimer::Allocate => {
                    self.allocate_timer = None;
                    self.on_allocate();
                }
            }
        }
        self.process_sessions(now);
    }

    fn close_sessions(&mut self) {
        for session in &mut self.sessions {
            if let Err(err) = session.close() {
                warn!("[{}]: session {} close: {}", self.name, session.id(), err);
            }
            while let Some(request) = session.poll_socket_request() {
                self.socket_requests.push_back(request);
            }
        }
        self.sessions.clear();
    }

    pub(crate) fn shutdown(&mut self) {
        self.close_sessions();
        self.ports.clear();
        self.connections.clear();
        self.best_connection = None;
        self.timers.clear();
        self.ping_timer = None;
        self.allocate_timer = None;
        self.waiting_for_signaling = false;
    }
}
