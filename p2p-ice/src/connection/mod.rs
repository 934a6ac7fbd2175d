
use bytes::BytesMut;
use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::binding::*;
use crate::candidate::Candidate;
use crate::port::PortId;
use shared::error::*;
use stun::attributes::ATTR_USERNAME;
use stun::error_code::*;
use stun::message::*;
use stun::request::{Retransmit, StunRequestEvent, StunRequestManager};
use stun::textattrs::Username;

/// A readable connection times out after this long without an inbound ping.
pub(crate) const CONNECTION_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// A connecting connection times out after this long without a response.
pub(crate) const CONNECTION_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// A writable connection starts reconnecting after this long without a response...
pub(crate) const CONNECTION_WRITE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// ...and at least this many unanswered pings.
pub(crate) const CONNECTION_WRITE_CONNECT_FAILURES: usize = 5;
/// How long a ping waits for its response.
pub(crate) const CONNECTION_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const MINIMUM_RTT: Duration = Duration::from_millis(100);
pub(crate) const MAXIMUM_RTT: Duration = Duration::from_millis(3000);
/// Estimate used before the first RTT sample.
pub(crate) const DEFAULT_RTT: Duration = MAXIMUM_RTT;
/// Weight of the previous RTT against a new sample.
const RTT_RATIO: u32 = 3;

/// Oldest unanswered pings kept; the failure window only looks at the first ones.
pub(crate) const MAX_PINGS_SINCE_LAST_RESPONSE: usize = 10;

/// Whether the remote side is known to be pinging us.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReadState {
    /// We have received pings recently.
    Readable,
    /// We haven't received pings in a while.
    ReadTimeout,
}

impl fmt::Display for ReadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            ReadState::Readable => "readable",
            ReadState::ReadTimeout => "read timeout",
        };
        write!(f, "{s}")
    }
}

/// Whether our pings are being answered. Variants are ordered best first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteState {
    /// We have received ping responses recently.
    Writable,
    /// We have had a few ping failures.
    WriteConnect,
    /// We have had a large number of ping failures.
    WriteTimeout,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            WriteState::Writable => "writable",
            WriteState::WriteConnect => "write connect",
            WriteState::WriteTimeout => "write timeout",
        };
        write!(f, "{s}")
    }
}

/// Identifies a connection: the owning port and the remote address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    pub port: PortId,
    pub remote_addr: SocketAddr,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.port, self.remote_addr)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    StateChange,
}

/// Bytes per second over whole elapsed seconds, carrying the fractional
/// remainder into the next window.
#[derive(Debug, Default)]
pub(crate) struct RateTracker {
    total: u64,
    snapshot: Option<(Instant, u64)>,
    rate: u64,
}

impl RateTracker {
    pub(crate) fn add(&mut self, n: usize) {
        self.total += n as u64;
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn rate(&mut self, now: Instant) -> u64 {
        match self.snapshot {
            None => self.snapshot = Some((now, self.total)),
            Some((time, total)) => {
                let delta = now.saturating_duration_since(time).as_millis() as u64;
                if delta >= 1000 {
                    let fraction_time = delta % 1000;
                    let seconds_time = delta - fraction_time;
                    let bytes = self.total - total;
                    let fraction_bytes = bytes * fraction_time / delta;
                    self.rate = (bytes - fraction_bytes) * 1000 / seconds_time;
                    self.snapshot = Some((
                        now - Duration::from_millis(fraction_time),
                        self.total - fraction_bytes,
                    ));
                }
            }
        }
        self.rate
    }
}

/// Connection is a path from one local port to one remote candidate, with
/// the liveness state machine driven by pings.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    name: String,
    local_candidate: usize,
    local_ufrag: String,
    remote_candidate: Candidate,

    read_state: ReadState,
    write_state: WriteState,
    connected: bool,
    pruned: bool,
    pending_delete: bool,

    rtt: Duration,
    rtt_samples: u32,
    last_ping_sent: Option<Instant>,
    last_ping_received: Option<Instant>,
    pings_since_last_response: Vec<Instant>,

    requests: StunRequestManager<()>,
    recv: RateTracker,
    sent: RateTracker,

    outbox: VecDeque<BytesMut>,
    reads: VecDeque<BytesMut>,
    events: VecDeque<ConnectionEvent>,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let read = match self.read_state {
            ReadState::Readable => 'R',
            ReadState::ReadTimeout => 'x',
        };
        let write = match self.write_state {
            WriteState::Writable => 'W',
            WriteState::WriteConnect => 'w',
            WriteState::WriteTimeout => 'x',
        };
        write!(
            f,
            "{}|{}{}|{}",
            self.name,
            read,
            write,
            self.rtt.as_millis()
        )
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        port_name: &str,
        local_candidate: usize,
        local_ufrag: String,
        remote_candidate: Candidate,
    ) -> Self {
        let name = format!("{}->{}", port_name, remote_candidate.address());
        Self {
            id,
            requests: StunRequestManager::new(name.clone()),
            name,
            local_candidate,
            local_ufrag,
            remote_candidate,
            read_state: ReadState::ReadTimeout,
            write_state: WriteState::WriteConnect,
            connected: true,
            pruned: false,
            pending_delete: false,
            rtt: Duration::ZERO,
            rtt_samples: 0,
            last_ping_sent: None,
            last_ping_received: None,
            pings_since_last_response: vec![],
            recv: RateTracker::default(),
            sent: RateTracker::default(),
            outbox: VecDeque::new(),
            reads: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the owning port's candidate this connection originates from.
    pub fn local_candidate_index(&self) -> usize {
        self.local_candidate
    }

    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote_candidate
    }

    pub fn read_state(&self) -> ReadState {
        self.read_state
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn readable(&self) -> bool {
        self.read_state == ReadState::Readable
    }

    pub fn writable(&self) -> bool {
        self.write_state == WriteState::Writable
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn pruned(&self) -> bool {
        self.pruned
    }

    /// Set once both directions timed out; the port removes the connection.
    pub fn pending_delete(&self) -> bool {
        self.pending_delete
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn rtt_samples(&self) -> u32 {
        self.rtt_samples
    }

    /// Response time allowance: twice the measured RTT, clamped to
    /// [MINIMUM_RTT, MAXIMUM_RTT].
    pub fn rtt_estimate(&self) -> Duration {
        if self.rtt_samples == 0 {
            return DEFAULT_RTT;
        }
        (self.rtt * 2).clamp(MINIMUM_RTT, MAXIMUM_RTT)
    }

    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.last_ping_sent
    }

    pub fn last_ping_received(&self) -> Option<Instant> {
        self.last_ping_received
    }

    pub fn pings_since_last_response(&self) -> &[Instant] {
        &self.pings_since_last_response
    }

    pub fn sent_total_bytes(&self) -> u64 {
        self.sent.total()
    }

    pub fn recv_total_bytes(&self) -> u64 {
        self.recv.total()
    }

    pub fn sent_bytes_second(&mut self, now: Instant) -> u64 {
        self.sent.rate(now)
    }

    pub fn recv_bytes_second(&mut self, now: Instant) -> u64 {
        self.recv.rate(now)
    }

    pub(crate) fn set_read_state(&mut self, state: ReadState) {
        if self.read_state != state {
            debug!("[{}]: read state {} -> {}", self.name, self.read_state, state);
            self.read_state = state;
            self.events.push_back(ConnectionEvent::StateChange);
            self.check_timeout();
        }
    }

    pub(crate) fn set_write_state(&mut self, state: WriteState) {
        if self.write_state != state {
            debug!(
                "[{}]: write state {} -> {}",
                self.name, self.write_state, state
            );
            self.write_state = state;
            self.events.push_back(ConnectionEvent::StateChange);
            self.check_timeout();
        }
    }

    /// Losing connectedness ends the connection for writing.
    pub(crate) fn set_connected(&mut self, connected: bool) {
        let was_connected = self.connected;
        self.connected = connected;
        if was_connected && !connected {
            self.set_write_state(WriteState::WriteTimeout);
        }
    }

    /// Outgoing stream connections start unconnected, without the timeout
    /// that losing a connection causes.
    pub(crate) fn set_pending_connect(&mut self) {
        self.connected = false;
    }

    fn check_timeout(&mut self) {
        if self.read_state == ReadState::ReadTimeout
            && self.write_state == WriteState::WriteTimeout
            && !self.pending_delete
        {
            debug!("[{}]: timed out in both directions", self.name);
            self.pending_delete = true;
        }
    }

    /// Re-evaluates the liveness states at `now`.
    pub fn update_state(&mut self, now: Instant) {
        if self.read_state == ReadState::Readable
            && self
                .last_ping_received
                .is_some_and(|t| t + CONNECTION_READ_TIMEOUT <= now)
        {
            self.set_read_state(ReadState::ReadTimeout);
        }

        if self.write_state == WriteState::Writable
            && self.too_many_failures(now)
            && self.too_long_without_response(CONNECTION_WRITE_CONNECT_TIMEOUT, now)
        {
            self.set_write_state(WriteState::WriteConnect);
        }

        if self.write_state == WriteState::WriteConnect
            && self.too_long_without_response(CONNECTION_WRITE_TIMEOUT, now)
        {
            self.set_write_state(WriteState::WriteTimeout);
        }
    }

    fn too_many_failures(&self, now: Instant) -> bool {
        self.pings_since_last_response
            .get(CONNECTION_WRITE_CONNECT_FAILURES - 1)
            .is_some_and(|t| *t + self.rtt_estimate() <= now)
    }

    fn too_long_without_response(&self, maximum: Duration, now: Instant) -> bool {
        self.pings_since_last_response
            .first()
            .is_some_and(|t| *t + maximum <= now)
    }

    /// Next instant at which `update_state` would change something.
    fn next_state_deadline(&self) -> Option<Instant> {
        let read = match self.read_state {
            ReadState::Readable => self.last_ping_received.map(|t| t + CONNECTION_READ_TIMEOUT),
            ReadState::ReadTimeout => None,
        };
        let write = match self.write_state {
            WriteState::Writable => {
                let failures = self
                    .pings_since_last_response
                    .get(CONNECTION_WRITE_CONNECT_FAILURES - 1)
                    .map(|t| *t + self.rtt_estimate());
                let first = self
                    .pings_since_last_response
                    .first()
                    .map(|t| *t + CONNECTION_WRITE_CONNECT_TIMEOUT);
                failures.zip(first).map(|(a, b)| a.max(b))
            }
            WriteState::WriteConnect => self
                .pings_since_last_response
                .first()
                .map(|t| *t + CONNECTION_WRITE_TIMEOUT),
            WriteState::WriteTimeout => None,
        };
        match (read, write) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sends a ping to the remote candidate.
    pub fn ping(&mut self, now: Instant) -> Result<()> {
        if !self.connected {
            return Err(Error::ErrConnectionNotConnected);
        }

        self.last_ping_sent = Some(now);
        if self.pings_since_last_response.len() < MAX_PINGS_SINCE_LAST_RESPONSE {
            self.pings_since_last_response.push(now);
        }

        let mut msg = Message::new(BINDING_REQUEST);
        Username::new(
            ATTR_USERNAME,
            format!("{}{}", self.remote_candidate.username(), self.local_ufrag),
        )
        .add_to(&mut msg)?;
        self.requests.send_with(
            (),
            msg,
            Retransmit::Once(CONNECTION_RESPONSE_TIMEOUT),
            Duration::ZERO,
            now,
        )?;
        self.flush_requests();
        Ok(())
    }

    /// Records an authenticated inbound ping.
    pub fn received_ping(&mut self, now: Instant) {
        self.last_ping_received = Some(now);
        self.set_read_state(ReadState::Readable);
    }

    /// Deprioritizes the connection: outstanding pings are dropped and it
    /// stops being writable, but it may still be revived by inbound traffic.
    pub fn prune(&mut self) {
        if !self.pruned {
            debug!("[{}]: pruned", self.name);
            self.pruned = true;
            self.requests.clear();
            self.set_write_state(WriteState::WriteTimeout);
        }
    }

    /// Times out both directions, which schedules the removal.
    pub fn destroy(&mut self) {
        debug!("[{}]: destroyed", self.name);
        self.set_read_state(ReadState::ReadTimeout);
        self.set_write_state(WriteState::WriteTimeout);
    }

    pub(crate) fn handle_read(&mut self, data: BytesMut, now: Instant) {
        match parse_binding_message(&self.name, &data, &self.local_ufrag) {
            BindingInput::Data => {
                if self.read_state == ReadState::Readable {
                    self.recv.add(data.len());
                    self.reads.push_back(data);
                    self.revive();
                } else {
                    warn!(
                        "[{}]: received non-STUN packet on unreadable connection",
                        self.name
                    );
                }
            }
            BindingInput::Handled { reply } => {
                if let Some(reply) = reply {
                    self.queue(&reply);
                }
            }
            BindingInput::Message {
                msg,
                remote_username,
            } => {
                if remote_username != self.remote_candidate.username() {
                    error!(
                        "[{}]: received {} with bad remote username {}",
                        self.name, msg.typ, remote_username
                    );
                    if msg.typ == BINDING_REQUEST {
                        self.reply_error(&msg, CODE_BAD_REQUEST);
                    }
                    return;
                }

                match msg.typ {
                    BINDING_REQUEST => {
                        match binding_response(&msg, self.id.remote_addr) {
                            Ok(response) => self.queue(&response),
                            Err(err) => warn!("[{}]: binding response: {}", self.name, err),
                        }
                        self.received_ping(now);
                        self.revive();
                    }
                    _ => {
                        self.requests.check_response(&msg, now);
                        self.process_request_events();
                    }
                }
            }
        }
        self.flush_requests();
    }

    /// Inbound traffic on a connection that timed out for writing lets it
    /// retry, unless it was pruned.
    fn revive(&mut self) {
        if !self.pruned && self.write_state == WriteState::WriteTimeout {
            self.set_write_state(WriteState::WriteConnect);
        }
    }

    fn process_request_events(&mut self) {
        while let Some(event) = self.requests.poll_event() {
            match event {
                StunRequestEvent::Response { response, rtt, .. } => {
                    self.on_ping_response(&response, rtt)
                }
                StunRequestEvent::ErrorResponse { response, .. } => {
                    self.on_ping_error_response(&response)
                }
                StunRequestEvent::Timeout { request, .. } => {
                    trace!(
                        "[{}]: ping {} timed out",
                        self.name, request.transaction_id
                    );
                }
            }
        }
    }

    fn on_ping_response(&mut self, response: &Message, rtt: Duration) {
        let valid = Username::get_from_as(response, ATTR_USERNAME).is_ok_and(|username| {
            username.text.len() > self.local_ufrag.len()
                && username.text.ends_with(&self.local_ufrag)
        });
        if !valid {
            error!("[{}]: received ping response with bad username", self.name);
            return;
        }

        self.set_write_state(WriteState::Writable);
        self.pings_since_last_response.clear();
        // the running average starts from zero, not from the first sample
        self.rtt = (self.rtt * RTT_RATIO + rtt) / (RTT_RATIO + 1);
        self.rtt_samples += 1;
        trace!(
            "[{}]: ping response, rtt sample {:?}, rtt {:?}",
            self.name, rtt, self.rtt
        );
    }

    fn on_ping_error_response(&mut self, response: &Message) {
        let mut error_code = ErrorCodeAttribute::default();
        let code = match error_code.get_from(response) {
            Ok(()) => error_code.code,
            Err(_) => CODE_GLOBAL_FAILURE,
        };

        match code {
            CODE_UNKNOWN_ATTRIBUTE | CODE_SERVER_ERROR | CODE_UNAUTHORIZED => {
                debug!("[{}]: recoverable ping error {}, retrying", self.name, code.0);
            }
            CODE_STALE_CREDENTIALS => {
                debug!("[{}]: ping raced with credentials, retrying", self.name);
            }
            _ => {
                error!(
                    "[{}]: received STUN error response, code={}; killing connection",
                    self.name, code.0
                );
                self.set_connected(false);
            }
        }
    }

    fn reply_error(&mut self, request: &Message, code: ErrorCode) {
        match binding_error_response(request, code) {
            Ok(response) => self.queue(&response),
            Err(err) => warn!("[{}]: binding error response: {}", self.name, err),
        }
    }

    fn queue(&mut self, msg: &Message) {
        match msg.marshal() {
            Ok(raw) => self.outbox.push_back(BytesMut::from(&raw[..])),
            Err(err) => warn!("[{}]: failed to encode {}: {}", self.name, msg.typ, err),
        }
    }

    fn flush_requests(&mut self) {
        while let Some(raw) = self.requests.poll_transmit() {
            self.outbox.push_back(raw);
        }
    }

    pub(crate) fn record_sent(&mut self, n: usize) {
        self.sent.add(n);
    }

    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        match (self.requests.poll_timeout(), self.next_state_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn handle_timeout(&mut self, now: Instant) {
        self.requests.handle_timeout(now);
        self.process_request_events();
        self.flush_requests();
        self.update_state(now);
    }

    /// STUN traffic waiting to be sent to the remote address.
    pub(crate) fn poll_outbox(&mut self) -> Option<BytesMut> {
        self.outbox.pop_front()
    }

    /// Application data received from the remote address.
    pub(crate) fn poll_read(&mut self) -> Option<BytesMut> {
        self.reads.pop_front()
    }

    pub(crate) fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }
}
