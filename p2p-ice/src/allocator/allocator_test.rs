use super::*;
use crate::candidate::CandidateConfig;
use crate::port::ProtocolAddress;
use crate::socket::{ProxyInfo, ProxyType};
use std::net::SocketAddr;
use stun::data::DEFAULT_MAGIC_COOKIE;

fn eth0() -> Network {
    Network::new("eth0", "10.0.0.1".parse().unwrap())
}

fn candidate(candidate_type: CandidateType, protocol: ProtocolType) -> Candidate {
    Candidate::from(CandidateConfig {
        name: "rtp".to_owned(),
        candidate_type,
        protocol,
        address: "10.0.0.1:5000".parse().unwrap(),
        preference: 1.0,
        username: "localfragment000".to_owned(),
        password: "localpassword000".to_owned(),
        network_name: "eth0".to_owned(),
        generation: 0,
    })
}

#[test]
fn test_sequence_steps_without_history() {
    let seq = AllocationSequence::new(eth0(), None);
    assert_eq!(seq.step_of_phase(Phase::Udp), 0);
    assert_eq!(seq.step_of_phase(Phase::Relay), 1);
    assert_eq!(seq.step_of_phase(Phase::Tcp), 2);
    assert_eq!(seq.step_of_phase(Phase::SslTcp), 3);
}

#[test]
fn test_sequence_steps_with_best_writable_phase() {
    let seq = AllocationSequence::new(eth0(), Some(Phase::Relay));
    assert_eq!(seq.step_of_phase(Phase::Udp), 0);
    assert_eq!(seq.step_of_phase(Phase::Relay), 0);
    assert_eq!(seq.step_of_phase(Phase::Tcp), 1);
    assert_eq!(seq.step_of_phase(Phase::SslTcp), 2);

    let seq = AllocationSequence::new(eth0(), Some(Phase::SslTcp));
    for phase in Phase::ALL {
        assert_eq!(seq.step_of_phase(phase), 0);
    }
}

#[test]
fn test_sequence_advance() {
    let mut seq = AllocationSequence::new(eth0(), Some(Phase::Relay));
    assert_eq!(seq.advance(), vec![Phase::Udp, Phase::Relay]);
    assert!(seq.has_pending_phases());
    assert_eq!(seq.advance(), vec![Phase::Tcp]);
    assert_eq!(seq.advance(), vec![Phase::SslTcp]);
    assert!(!seq.has_pending_phases());
    assert!(seq.advance().is_empty());
    assert_eq!(seq.step(), 4);
}

#[test]
fn test_sequence_protocols() {
    let mut seq = AllocationSequence::new(eth0(), None);
    assert!(!seq.protocol_enabled(ProtocolType::Udp));
    assert!(seq.enable_protocol(ProtocolType::Udp));
    assert!(!seq.enable_protocol(ProtocolType::Udp));
    assert!(seq.protocol_enabled(ProtocolType::Udp));
    assert!(!seq.protocol_enabled(ProtocolType::Tcp));
}

#[test]
fn test_sequence_is_equivalent() {
    let seq = AllocationSequence::new(eth0(), None);
    assert!(seq.is_equivalent(&eth0()));
    assert!(!seq.is_equivalent(&Network::new("eth1", "10.0.0.1".parse().unwrap())));
    assert!(!seq.is_equivalent(&Network::new("eth0", "10.0.0.9".parse().unwrap())));
}

#[test]
fn test_local_candidate_to_phase() {
    let cases = [
        (CandidateType::Local, ProtocolType::Udp, Phase::Udp),
        (CandidateType::Stun, ProtocolType::Udp, Phase::Udp),
        (CandidateType::Relay, ProtocolType::Udp, Phase::Relay),
        (CandidateType::Local, ProtocolType::Tcp, Phase::Tcp),
        (CandidateType::Relay, ProtocolType::Tcp, Phase::Tcp),
        (CandidateType::Relay, ProtocolType::SslTcp, Phase::SslTcp),
    ];
    for (candidate_type, protocol, expected) in cases {
        assert_eq!(
            local_candidate_to_phase(&candidate(candidate_type, protocol)),
            expected,
            "{candidate_type} {protocol}"
        );
    }
}

#[test]
fn test_allocator_add_writable_phase_keeps_earliest() {
    let mut allocator = BasicPortAllocator::new(AllocatorConfig::default());
    assert_eq!(allocator.best_writable_phase(), None);

    allocator.add_writable_phase(Phase::Tcp);
    assert_eq!(allocator.best_writable_phase(), Some(Phase::Tcp));
    allocator.add_writable_phase(Phase::SslTcp);
    assert_eq!(allocator.best_writable_phase(), Some(Phase::Tcp));
    allocator.add_writable_phase(Phase::Udp);
    assert_eq!(allocator.best_writable_phase(), Some(Phase::Udp));
}

#[test]
fn test_allocator_https_proxy_starts_with_relay() {
    let config = AllocatorConfig {
        proxy: ProxyInfo {
            proxy_type: ProxyType::Https,
            address: Some("192.0.2.1:8080".parse().unwrap()),
            ..Default::default()
        },
        ..Default::default()
    };
    let mut allocator = BasicPortAllocator::new(config);
    assert_eq!(allocator.best_writable_phase(), Some(Phase::Relay));

    // real history wins over the guess
    allocator.add_writable_phase(Phase::SslTcp);
    assert_eq!(allocator.best_writable_phase(), Some(Phase::SslTcp));
}

#[test]
fn test_allocator_create_session() {
    let mut allocator = BasicPortAllocator::new(AllocatorConfig::default());
    allocator.set_networks(vec![eth0()]);
    allocator.add_writable_phase(Phase::Relay);

    let first = allocator.create_session("rtp");
    let second = allocator.create_session("rtcp");
    assert_ne!(first.id(), second.id());
    assert_eq!(first.name(), "rtp");
    assert_eq!(first.networks(), &[eth0()]);
    assert_eq!(first.best_writable_phase(), Some(Phase::Relay));
    assert!(!first.is_getting_all_ports());
    assert!(first.port_configuration().is_none());
}

#[test]
fn test_port_configuration_from_config() {
    let relay: SocketAddr = "192.0.2.20:3478".parse().unwrap();
    let config = AllocatorConfig {
        stun_server: Some("192.0.2.10:3478".parse().unwrap()),
        relay_servers: vec![RelayServerConfig {
            addresses: vec![ProtocolAddress::new(relay, ProtocolType::Udp)],
            pref_modifier: RELAY_BACKUP_PREF_MODIFIER,
        }],
        ..Default::default()
    };

    let port_config = PortConfiguration::from_config(&config);
    assert_eq!(port_config.stun_address, config.stun_server);
    assert_eq!(port_config.magic_cookie, DEFAULT_MAGIC_COOKIE.to_vec());
    assert!(!port_config.username.is_empty());
    assert!(!port_config.password.is_empty());
    assert_eq!(port_config.relays.len(), 1);
    assert_eq!(port_config.relays[0].pref_modifier, RELAY_BACKUP_PREF_MODIFIER);
    assert!(port_config.supports_protocol(ProtocolType::Udp));
    assert!(!port_config.supports_protocol(ProtocolType::Tcp));

    let config = AllocatorConfig {
        relay_username: "relayuser".to_owned(),
        relay_password: "relaypass".to_owned(),
        magic_cookie: vec![1, 2, 3, 4],
        ..Default::default()
    };
    let port_config = PortConfiguration::from_config(&config);
    assert_eq!(port_config.username, "relayuser");
    assert_eq!(port_config.password, "relaypass");
    assert_eq!(port_config.magic_cookie, vec![1, 2, 3, 4]);
    assert!(port_config.relays.is_empty());
}
