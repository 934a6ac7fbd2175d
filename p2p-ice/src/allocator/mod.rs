#[cfg(test)]
mod allocator_test;

pub mod allocator_config;
pub mod port_configuration;
pub mod sequence;
pub mod session;
mod session_proto;

use std::fmt;
use std::time::Duration;

pub use allocator_config::{AllocatorConfig, RelayServerConfig};
pub use port_configuration::{PortConfiguration, RelayServer};
pub use sequence::AllocationSequence;
pub use session::{Session, SessionEvent};

use crate::candidate::{Candidate, CandidateType, ProtocolType};
use crate::network::Network;

/// Interval of network re-scans while a session is getting all ports.
pub(crate) const ALLOCATE_DELAY: Duration = Duration::from_millis(250);
/// Interval between the steps of an allocation sequence.
pub(crate) const ALLOCATION_STEP_DELAY: Duration = Duration::from_secs(1);

pub(crate) const SHAKE_MIN_DELAY: Duration = Duration::from_secs(45);
pub(crate) const SHAKE_MAX_DELAY: Duration = Duration::from_secs(90);

pub(crate) const PREF_LOCAL_UDP: f32 = 1.0;
pub(crate) const PREF_LOCAL_STUN: f32 = 0.9;
pub(crate) const PREF_LOCAL_TCP: f32 = 0.8;
pub(crate) const PREF_RELAY: f32 = 0.5;

/// Preference modifier of the primary relay server.
pub const RELAY_PRIMARY_PREF_MODIFIER: f32 = 0.0;
/// Preference modifier of backup relay servers.
pub const RELAY_BACKUP_PREF_MODIFIER: f32 = -0.2;

/// Phase is one candidate gathering mechanism, in the order sequences run
/// them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Local UDP and STUN ports.
    Udp,
    Relay,
    Tcp,
    SslTcp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Phase::Udp => "udp",
            Phase::Relay => "relay",
            Phase::Tcp => "tcp",
            Phase::SslTcp => "ssltcp",
        };
        write!(f, "{s}")
    }
}

impl Phase {
    pub const COUNT: usize = 4;
    pub const ALL: [Phase; Phase::COUNT] = [Phase::Udp, Phase::Relay, Phase::Tcp, Phase::SslTcp];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// The phase whose port produced `candidate`.
pub fn local_candidate_to_phase(candidate: &Candidate) -> Phase {
    match (candidate.candidate_type(), candidate.protocol()) {
        (CandidateType::Local, ProtocolType::Udp) | (CandidateType::Stun, _) => Phase::Udp,
        (CandidateType::Relay, ProtocolType::Udp) => Phase::Relay,
        (_, ProtocolType::Tcp) => Phase::Tcp,
        (_, ProtocolType::SslTcp) => Phase::SslTcp,
    }
}

/// BasicPortAllocator creates allocator sessions over the local networks and
/// remembers which phase first produced a writable connection, so that later
/// sessions run it right away.
#[derive(Debug)]
pub struct BasicPortAllocator {
    config: AllocatorConfig,
    networks: Vec<Network>,
    best_writable_phase: Option<Phase>,
    next_session_id: u32,
}

impl BasicPortAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self {
            config,
            networks: vec![],
            best_writable_phase: None,
            next_session_id: 0,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Replaces the known local networks with a fresh enumeration.
    pub fn set_networks(&mut self, networks: Vec<Network>) {
        self.networks = networks;
    }

    /// The earliest phase that produced a writable connection. Behind an
    /// HTTPS like proxy the relay is the best bet until something worked.
    pub fn best_writable_phase(&self) -> Option<Phase> {
        if self.best_writable_phase.is_none() && self.config.proxy.is_https_like() {
            return Some(Phase::Relay);
        }
        self.best_writable_phase
    }

    pub fn add_writable_phase(&mut self, phase: Phase) {
        if self.best_writable_phase.is_none_or(|best| phase < best) {
            self.best_writable_phase = Some(phase);
        }
    }

    /// Creates a session gathering ports for the channel `name`.
    pub fn create_session(&mut self, name: &str) -> Session {
        let id = self.next_session_id;
        self.next_session_id += 1;
        Session::new(
            id,
            name,
            self.config.clone(),
            self.networks.clone(),
            self.best_writable_phase(),
        )
    }
}
