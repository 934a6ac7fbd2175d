use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::PortBase;
use super::udp_port::UdpPort;
use crate::candidate::ProtocolType;
use crate::socket::{SocketEvent, SocketId};
use shared::error::*;
use shared::{TaggedBytesMut, TransportProtocol};
use stun::addr::MappedAddress;
use stun::error_code::ErrorCodeAttribute;
use stun::message::*;
use stun::request::{StunRequestEvent, StunRequestManager};

/// Interval between binding refreshes with the STUN server.
pub(crate) const STUN_KEEPALIVE_DELAY: Duration = Duration::from_secs(10);
/// Delay before retrying a binding request that timed out.
pub(crate) const STUN_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Retries of a binding chain stop this long after its first request.
pub(crate) const STUN_RETRY_TIMEOUT: Duration = Duration::from_secs(50);

/// A chain of binding requests: the first request and all its retries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct BindingChain {
    start: Instant,
}

/// StunPort is a UDP port that also learns its public address from a STUN
/// server and keeps that binding alive.
#[derive(Debug)]
pub struct StunPort {
    udp: UdpPort,
    server_addr: SocketAddr,
    requests: StunRequestManager<BindingChain>,
}

impl StunPort {
    pub(crate) fn new(local_addr: SocketAddr, server_addr: SocketAddr) -> Self {
        Self {
            udp: UdpPort::new(local_addr),
            server_addr,
            requests: StunRequestManager::new(format!("stun-{server_addr}")),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.udp.bound_addr()
    }

    pub(crate) fn socket(&self) -> Option<SocketId> {
        self.udp.socket()
    }

    pub(crate) fn prepare_address(&mut self, base: &mut PortBase) {
        self.udp.prepare_address(base);
    }

    pub(crate) fn handle_socket_event(&mut self, base: &mut PortBase, event: SocketEvent, now: Instant) {
        if self.udp.on_socket_event(base, event).is_some() {
            self.send_binding_request(base, BindingChain { start: now }, Duration::ZERO, now);
        }
    }

    fn send_binding_request(
        &mut self,
        base: &mut PortBase,
        chain: BindingChain,
        delay: Duration,
        now: Instant,
    ) {
        let msg = Message::new(BINDING_REQUEST);
        if let Err(err) = self.requests.send_delayed(chain, msg, delay, now) {
            warn!("[{}]: failed to send binding request: {}", base.log_name(), err);
        }
        self.flush(base, now);
    }

    pub(crate) fn send_to(
        &mut self,
        base: &mut PortBase,
        data: &[u8],
        addr: SocketAddr,
        now: Instant,
    ) -> Result<usize> {
        self.udp.send_to(base, data, addr, now)
    }

    /// Answers from the server go to the binding requests, everything else
    /// is handled like on any other port.
    pub(crate) fn handle_read(&mut self, base: &mut PortBase, msg: TaggedBytesMut) {
        let now = msg.now;
        if msg.transport.peer_addr == self.server_addr {
            if let Ok(response) = Message::unmarshal(&msg.message) {
                if self.requests.check_response(&response, now) {
                    self.process_events(base, now);
                    return;
                }
            }
        }
        base.on_read_packet(msg.message, msg.transport.peer_addr, now);
    }

    fn process_events(&mut self, base: &mut PortBase, now: Instant) {
        while let Some(event) = self.requests.poll_event() {
            match event {
                StunRequestEvent::Response { response, .. } => {
                    let mut mapped = MappedAddress::default();
                    match mapped.get_from(&response) {
                        Ok(()) => {
                            if base.candidates().is_empty() {
                                info!(
                                    "[{}]: STUN binding is {}",
                                    base.log_name(),
                                    mapped.socket_addr()
                                );
                                base.add_address(mapped.socket_addr(), ProtocolType::Udp, true);
                            }
                        }
                        Err(err) => {
                            warn!("[{}]: bad binding response: {}", base.log_name(), err);
                        }
                    }
                    let chain = BindingChain {
                        start: now + STUN_KEEPALIVE_DELAY,
                    };
                    self.send_binding_request(base, chain, STUN_KEEPALIVE_DELAY, now);
                }
                StunRequestEvent::ErrorResponse { kind, response, .. } => {
                    let mut error_code = ErrorCodeAttribute::default();
                    match error_code.get_from(&response) {
                        Ok(()) => warn!(
                            "[{}]: binding error response: {}",
                            base.log_name(),
                            error_code
                        ),
                        Err(_) => warn!("[{}]: bad binding error response", base.log_name()),
                    }
                    if now.saturating_duration_since(kind.start) <= STUN_RETRY_TIMEOUT {
                        self.send_binding_request(base, kind, STUN_KEEPALIVE_DELAY, now);
                    }
                }
                StunRequestEvent::Timeout { kind, .. } => {
                    if now.saturating_duration_since(kind.start) <= STUN_RETRY_TIMEOUT {
                        debug!("[{}]: binding request timed out, retrying", base.log_name());
                        self.send_binding_request(base, kind, STUN_RETRY_DELAY, now);
                    } else {
                        warn!(
                            "[{}]: binding requests to {} failed for {:?}",
                            base.log_name(),
                            self.server_addr,
                            STUN_RETRY_TIMEOUT
                        );
                        let chain = BindingChain {
                            start: now + STUN_KEEPALIVE_DELAY,
                        };
                        self.send_binding_request(base, chain, STUN_KEEPALIVE_DELAY, now);
                    }
                }
            }
        }
    }

    fn flush(&mut self, base: &mut PortBase, now: Instant) {
        while let Some(raw) = self.requests.poll_transmit() {
            match self.udp.bound_addr() {
                Some(local_addr) => {
                    base.transmit(local_addr, self.server_addr, TransportProtocol::UDP, raw, now)
                }
                None => debug!("[{}]: dropping binding request, not bound", base.log_name()),
            }
        }
    }

    pub(crate) fn poll_timeout(&mut self) -> Option<Instant> {
        self.requests.poll_timeout()
    }

    pub(crate) fn handle_timeout(&mut self, base: &mut PortBase, now: Instant) {
        self.requests.handle_timeout(now);
        self.flush(base, now);
        self.process_events(base, now);
    }

    pub(crate) fn close(&mut self, base: &mut PortBase) {
        self.requests.clear();
        self.udp.close(base);
    }
}
