use log::debug;
use shared::TimerId;

use super::Phase;
use crate::candidate::ProtocolType;
use crate::network::Network;

/// AllocationSequence schedules the phases of port creation on one network.
///
/// Phases up to the best writable phase seen so far run together in step 0,
/// the later ones follow one per step. Without any history only the UDP phase
/// runs in step 0.
#[derive(Debug)]
pub struct AllocationSequence {
    network: Network,
    step: usize,
    step_of_phase: [usize; Phase::COUNT],
    running: bool,
    pub(crate) timer: Option<TimerId>,
    protocols: Vec<ProtocolType>,
}

impl AllocationSequence {
    pub(crate) fn new(network: Network, best_writable_phase: Option<Phase>) -> Self {
        let last_phase_in_step_zero = best_writable_phase.map_or(0, |phase| phase.index());
        let mut step_of_phase = [0; Phase::COUNT];
        for phase in Phase::ALL {
            step_of_phase[phase.index()] = phase.index().saturating_sub(last_phase_in_step_zero);
        }
        Self {
            network,
            step: 0,
            step_of_phase,
            running: false,
            timer: None,
            protocols: vec![],
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Whether this sequence already covers `network`: same interface and
    /// address.
    pub fn is_equivalent(&self, network: &Network) -> bool {
        self.network.name() == network.name() && self.network.ip() == network.ip()
    }

    /// The step that runs next.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn step_of_phase(&self, phase: Phase) -> usize {
        self.step_of_phase[phase.index()]
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Whether steps with phases remain.
    pub fn has_pending_phases(&self) -> bool {
        self.step_of_phase.iter().any(|step| *step >= self.step)
    }

    pub(crate) fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Returns the phases of the current step and moves on to the next.
    pub(crate) fn advance(&mut self) -> Vec<Phase> {
        let phases: Vec<Phase> = Phase::ALL
            .into_iter()
            .filter(|phase| self.step_of_phase[phase.index()] == self.step)
            .collect();
        for phase in &phases {
            debug!("{}: phase={} step={}", self.network, phase, self.step);
        }
        self.step += 1;
        phases
    }

    /// Returns true if `protocol` was not enabled before.
    pub(crate) fn enable_protocol(&mut self, protocol: ProtocolType) -> bool {
        if self.protocol_enabled(protocol) {
            return false;
        }
        self.protocols.push(protocol);
        true
    }

    /// Candidates of a protocol are only reported once its phase ran.
    pub fn protocol_enabled(&self, protocol: ProtocolType) -> bool {
        self.protocols.contains(&protocol)
    }
}
