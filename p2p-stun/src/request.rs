use bytes::BytesMut;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::message::*;
use shared::error::*;
use shared::{TimerId, TimerQueue};

/// Delay unit of the retransmission backoff.
pub const DELAY_UNIT: Duration = Duration::from_millis(100);
/// Largest backoff multiplier.
pub const DELAY_MAX_FACTOR: u32 = 16;
/// Total number of transmissions before a request times out.
pub const MAX_SENDS: u32 = 9;

/// Retransmit selects how a request is re-sent while it waits for an answer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Retransmit {
    /// Re-send after `100ms * min(2^attempt, 16)`, time out after 9 sends.
    #[default]
    Backoff,
    /// Send once and time out when no answer arrived within the duration.
    Once(Duration),
}

/// StunRequest is an outstanding transaction.
#[derive(Debug)]
pub struct StunRequest<T> {
    kind: T,
    msg: Message,
    raw: Vec<u8>,
    retransmit: Retransmit,
    count: u32,
    tstamp: Option<Instant>,
    timer: Option<TimerId>,
}

impl<T> StunRequest<T> {
    pub fn kind(&self) -> &T {
        &self.kind
    }

    pub fn msg(&self) -> &Message {
        &self.msg
    }

    /// count returns the number of transmissions so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// elapsed returns the time since the last transmission.
    pub fn elapsed(&self, now: Instant) -> Duration {
        self.tstamp
            .map(|tstamp| now.saturating_duration_since(tstamp))
            .unwrap_or_default()
    }

    fn next_delay(&self) -> Duration {
        match self.retransmit {
            Retransmit::Backoff => {
                let factor = 1u32
                    .checked_shl(self.count)
                    .unwrap_or(DELAY_MAX_FACTOR)
                    .min(DELAY_MAX_FACTOR);
                DELAY_UNIT * factor
            }
            Retransmit::Once(timeout) => timeout,
        }
    }

    fn exhausted(&self) -> bool {
        match self.retransmit {
            Retransmit::Backoff => self.count >= MAX_SENDS,
            Retransmit::Once(_) => self.count >= 1,
        }
    }
}

/// StunRequestEvent reports how an outstanding request ended.
#[derive(Debug)]
pub enum StunRequestEvent<T> {
    /// An answer of the expected success type arrived; `rtt` is the time since
    /// the last transmission.
    Response {
        kind: T,
        request: Message,
        response: Message,
        rtt: Duration,
    },
    /// An answer of the expected error type arrived.
    ErrorResponse {
        kind: T,
        request: Message,
        response: Message,
        rtt: Duration,
    },
    /// No answer arrived after the last transmission.
    Timeout { kind: T, request: Message },
}

/// StunRequestManager tracks outstanding requests by transaction id, owns
/// their retransmission schedule and dispatches answers.
///
/// Each request carries a caller defined `kind` that comes back with its
/// event, so the owner decides what an answer means.
#[derive(Debug)]
pub struct StunRequestManager<T> {
    name: String,
    requests: HashMap<TransactionId, StunRequest<T>>,
    timers: TimerQueue<TransactionId>,
    transmits: VecDeque<BytesMut>,
    events: VecDeque<StunRequestEvent<T>>,
}

impl<T> Default for StunRequestManager<T> {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl<T> StunRequestManager<T> {
    pub fn new(name: String) -> Self {
        Self {
            name,
            requests: HashMap::new(),
            timers: TimerQueue::new(),
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// send registers `msg` and transmits it right away.
    pub fn send(&mut self, kind: T, msg: Message, now: Instant) -> Result<TransactionId> {
        self.send_with(kind, msg, Retransmit::Backoff, Duration::ZERO, now)
    }

    /// send_delayed registers `msg` and transmits it after `delay`.
    pub fn send_delayed(
        &mut self,
        kind: T,
        msg: Message,
        delay: Duration,
        now: Instant,
    ) -> Result<TransactionId> {
        self.send_with(kind, msg, Retransmit::Backoff, delay, now)
    }

    /// send_with registers `msg` under a fresh transaction id with the given
    /// retransmit schedule. The message is encoded once and cached.
    pub fn send_with(
        &mut self,
        kind: T,
        mut msg: Message,
        retransmit: Retransmit,
        delay: Duration,
        now: Instant,
    ) -> Result<TransactionId> {
        let mut id = TransactionId::new();
        while self.requests.contains_key(&id) {
            id = TransactionId::new();
        }
        msg.transaction_id = id;
        let raw = msg.marshal()?;

        let mut request = StunRequest {
            kind,
            msg,
            raw,
            retransmit,
            count: 0,
            tstamp: None,
            timer: None,
        };

        if delay.is_zero() {
            self.transmit(&mut request, now);
        } else {
            request.timer = Some(self.timers.schedule(now + delay, id));
        }
        self.requests.insert(id, request);

        Ok(id)
    }

    /// check_response matches `msg` against the outstanding requests. A match
    /// of the expected answer type removes the request and queues its event;
    /// any other type with a known id is logged and leaves the request alone.
    pub fn check_response(&mut self, msg: &Message, now: Instant) -> bool {
        let Some(request) = self.requests.get(&msg.transaction_id) else {
            return false;
        };

        let expected = request.msg.typ.response_type();
        let expected_error = request.msg.typ.error_response_type();
        if msg.typ != expected && msg.typ != expected_error {
            warn!(
                "[{}]: received response with wrong type: {} (expecting {})",
                self.name, msg.typ, expected
            );
            return false;
        }

        let Some(request) = self.requests.remove(&msg.transaction_id) else {
            return false;
        };
        if let Some(timer) = request.timer {
            self.timers.cancel(timer);
        }

        let rtt = request.elapsed(now);
        let event = if msg.typ == expected {
            StunRequestEvent::Response {
                kind: request.kind,
                request: request.msg,
                response: msg.clone(),
                rtt,
            }
        } else {
            StunRequestEvent::ErrorResponse {
                kind: request.kind,
                request: request.msg,
                response: msg.clone(),
                rtt,
            }
        };
        self.events.push_back(event);

        true
    }

    /// clear cancels every outstanding request without firing any event.
    pub fn clear(&mut self) {
        if !self.requests.is_empty() {
            debug!(
                "[{}]: cancelling {} outstanding requests",
                self.name,
                self.requests.len()
            );
        }
        self.requests.clear();
        self.timers.clear();
    }

    pub fn get(&self, id: &TransactionId) -> Option<&StunRequest<T>> {
        self.requests.get(id)
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.requests.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn poll_timeout(&mut self) -> Option<Instant> {
        self.timers.poll_timeout()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        while let Some(id) = self.timers.pop_expired(now) {
            let Some(mut request) = self.requests.remove(&id) else {
                continue;
            };
            request.timer = None;

            if request.exhausted() {
                debug!(
                    "[{}]: {} {} timed out after {} sends",
                    self.name, request.msg.typ, id, request.count
                );
                self.events.push_back(StunRequestEvent::Timeout {
                    kind: request.kind,
                    request: request.msg,
                });
            } else {
                self.transmit(&mut request, now);
                self.requests.insert(id, request);
            }
        }
    }

    /// poll_transmit returns the next encoded message to send to the peer.
    pub fn poll_transmit(&mut self) -> Option<BytesMut> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<StunRequestEvent<T>> {
        self.events.pop_front()
    }

    fn transmit(&mut self, request: &mut StunRequest<T>, now: Instant) {
        let id = request.msg.transaction_id;
        trace!(
            "[{}]: sending {} {} (attempt {})",
            self.name,
            request.msg.typ,
            id,
            request.count + 1
        );
        self.transmits.push_back(BytesMut::from(&request.raw[..]));
        request.tstamp = Some(now);
        let delay = request.next_delay();
        request.count += 1;
        request.timer = Some(self.timers.schedule(now + delay, id));
    }
}
