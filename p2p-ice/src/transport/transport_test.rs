use super::*;
use crate::allocator::{AllocatorConfig, Phase};
use crate::binding::binding_response;
use crate::candidate::{CandidateConfig, CandidateType, ProtocolType};
use crate::port::PortId;
use crate::socket::SocketId;
use shared::{TransportContext, TransportMessage, TransportProtocol};
use stun::attributes::ATTR_USERNAME;
use stun::error_code::ErrorCodeAttribute;
use stun::message::*;
use stun::textattrs::Username;

const REMOTE_UFRAG: &str = "remotefragment00";

fn local_addr() -> SocketAddr {
    "10.0.0.1:40000".parse().unwrap()
}

fn remote_addr() -> SocketAddr {
    "10.0.0.2:5000".parse().unwrap()
}

fn new_transport() -> Transport {
    let mut allocator = BasicPortAllocator::new(AllocatorConfig {
        disable_tcp: true,
        disable_relay: true,
        ..Default::default()
    });
    allocator.set_networks(vec![Network::new("eth0", "10.0.0.1".parse().unwrap())]);
    Transport::new("rtp", allocator, TransportConfig::default())
}

fn remote_candidate(addr: SocketAddr, generation: u32) -> Candidate {
    Candidate::from(CandidateConfig {
        name: "rtp".to_owned(),
        candidate_type: CandidateType::Local,
        protocol: ProtocolType::Udp,
        address: addr,
        preference: 1.0,
        username: REMOTE_UFRAG.to_owned(),
        password: "remotepassword00".to_owned(),
        network_name: "eth0".to_owned(),
        generation,
    })
}

fn drain_events(transport: &mut Transport) -> Vec<TransportEvent> {
    let mut events = vec![];
    while let Some(event) = transport.poll_event() {
        events.push(event);
    }
    events
}

fn pop_message(transport: &mut Transport) -> Result<(TransportContext, Message)> {
    let transmit = transport
        .poll_write()
        .ok_or(Error::Other("no transmit".to_owned()))?;
    Ok((transmit.transport, Message::unmarshal(&transmit.message)?))
}

fn inbound(
    transport: &mut Transport,
    socket: SocketId,
    from: SocketAddr,
    data: &[u8],
    now: Instant,
) -> Result<()> {
    transport.handle_read(SocketData {
        socket,
        msg: TransportMessage {
            now,
            transport: TransportContext {
                local_addr: local_addr(),
                peer_addr: from,
                transport_protocol: TransportProtocol::UDP,
            },
            message: BytesMut::from(data),
        },
    })
}

/// Starts the transport and binds the socket of its UDP port.
fn start(transport: &mut Transport, now: Instant) -> Result<SocketId> {
    transport.start_processing_candidates(now);
    assert_eq!(
        drain_events(transport),
        vec![TransportEvent::RequestSignaling]
    );
    transport.on_signaling_ready(now);

    let socket = match transport.poll_socket_request() {
        Some(SocketRequest::BindUdp { socket, .. }) => socket,
        other => panic!("unexpected {other:?}"),
    };
    transport.handle_event(SocketNotice {
        now,
        event: SocketEvent::Bound {
            socket,
            local_addr: local_addr(),
        },
    })?;
    Ok(socket)
}

/// Pings the remote candidate and answers the ping.
fn become_writable(transport: &mut Transport, socket: SocketId, now: Instant) -> Result<()> {
    transport.add_remote_candidates(&[remote_candidate(remote_addr(), 0)], now);
    transport.handle_timeout(now)?;
    let (context, request) = pop_message(transport)?;
    assert_eq!(context.peer_addr, remote_addr());
    assert_eq!(request.typ, BINDING_REQUEST);

    let response = binding_response(&request, local_addr())?;
    inbound(
        transport,
        socket,
        remote_addr(),
        &response.marshal()?,
        now + Duration::from_millis(10),
    )
}

fn ranking(index: u32, write_state: WriteState, preference: f64, rtt_ms: u64) -> Ranking {
    Ranking {
        id: ConnectionId {
            port: PortId { session: 0, index },
            remote_addr: remote_addr(),
        },
        write_state,
        read_state: ReadState::ReadTimeout,
        connected: true,
        preference,
        rtt: Duration::from_millis(rtt_ms),
        last_ping_sent: None,
        network: Network::new("eth0", "10.0.0.1".parse().unwrap()),
    }
}

#[test]
fn test_compare_connections() {
    let writable = ranking(0, WriteState::Writable, 0.5, 100);
    let connecting = ranking(1, WriteState::WriteConnect, 1.0, 100);
    let preferred = ranking(2, WriteState::Writable, 1.0, 100);

    assert_eq!(compare_connections(&writable, &connecting), Ordering::Greater);
    assert_eq!(compare_connections(&preferred, &writable), Ordering::Greater);
    assert_eq!(compare_connections(&writable, &writable), Ordering::Equal);
    assert_eq!(
        compare_connection_candidates(&connecting, &writable),
        Ordering::Greater
    );
}

#[test]
fn test_should_switch() {
    let best = ranking(0, WriteState::Writable, 1.0, 100);
    let worse = ranking(1, WriteState::Writable, 0.5, 10);
    let faster = ranking(2, WriteState::Writable, 1.0, 50);
    let about_as_fast = ranking(3, WriteState::Writable, 1.0, 110);
    let slower = ranking(4, WriteState::Writable, 1.0, 111);

    assert!(!should_switch(None, None));
    assert!(should_switch(None, Some(&best)));
    assert!(!should_switch(Some(&best), Some(&best)));
    assert!(!should_switch(Some(&best), Some(&worse)));
    assert!(should_switch(Some(&worse), Some(&best)));
    assert!(should_switch(Some(&best), Some(&faster)));
    assert!(should_switch(Some(&best), Some(&about_as_fast)));
    assert!(!should_switch(Some(&best), Some(&slower)));
}

#[test]
fn test_transport_start() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    start(&mut transport, now)?;

    assert_eq!(transport.sessions().len(), 1);
    assert_eq!(transport.sessions()[0].generation(), 0);
    assert!(!transport.sessions()[0].is_getting_all_ports());
    assert_eq!(transport.state(), TransportState::Connecting);

    let events = drain_events(&mut transport);
    assert_eq!(events.len(), 1, "{events:?}");
    match &events[0] {
        TransportEvent::CandidatesReady(candidates) => {
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].address(), local_addr());
        }
        other => panic!("unexpected {other:?}"),
    }

    // the first ping round is due right away
    assert_eq!(transport.poll_timeout(), Some(now));
    Ok(())
}

#[test]
fn test_transport_signaling_ready_without_request() -> Result<()> {
    let mut transport = new_transport();
    transport.on_signaling_ready(Instant::now());
    assert!(transport.sessions().is_empty());
    assert!(transport.poll_socket_request().is_none());
    Ok(())
}

#[test]
fn test_transport_remote_candidates() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    start(&mut transport, now)?;
    drain_events(&mut transport);

    transport.add_remote_candidates(&[remote_candidate(remote_addr(), 0)], now);
    assert_eq!(transport.connections().count(), 1);
    assert_eq!(transport.remote_candidates().count(), 1);
    // remote candidates make the sessions get all ports
    assert!(transport.sessions()[0].is_getting_all_ports());

    // duplicates are ignored
    transport.add_remote_candidates(&[remote_candidate(remote_addr(), 0)], now);
    assert_eq!(transport.connections().count(), 1);
    assert_eq!(transport.remote_candidates().count(), 1);

    // a newer generation replaces the older ones
    let newer: SocketAddr = "10.0.0.2:6000".parse().unwrap();
    transport.add_remote_candidates(&[remote_candidate(newer, 1)], now);
    let remotes: Vec<SocketAddr> = transport.remote_candidates().map(|c| c.address()).collect();
    assert_eq!(remotes, vec![newer]);
    assert_eq!(transport.connections().count(), 2);
    Ok(())
}

#[test]
fn test_transport_send_without_connection() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    start(&mut transport, now)?;
    assert_eq!(transport.send(b"hello", now), Err(Error::ErrWouldBlock));
    Ok(())
}

#[test]
fn test_transport_becomes_writable() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;
    drain_events(&mut transport);

    become_writable(&mut transport, socket, now)?;
    let events = drain_events(&mut transport);
    assert!(
        events.contains(&TransportEvent::BestConnectionChanged(remote_addr())),
        "{events:?}"
    );
    assert!(events.contains(&TransportEvent::StateChange(TransportState::Writable)));
    assert!(transport.writable());
    assert_eq!(transport.state(), TransportState::Writable);
    assert_eq!(transport.allocator().best_writable_phase(), Some(Phase::Udp));
    // gathering stops once something works
    assert!(!transport.sessions()[0].is_getting_all_ports());

    let later = now + Duration::from_millis(20);
    assert_eq!(transport.send(b"hello", later)?, 5);
    let transmit = transport
        .poll_write()
        .ok_or(Error::Other("no transmit".to_owned()))?;
    assert_eq!(transmit.transport.peer_addr, remote_addr());
    assert_eq!(&transmit.message[..], b"hello");

    // the sansio write path goes the same way
    transport.handle_write(Packet {
        now: later,
        data: BytesMut::from(&b"world"[..]),
    })?;
    let transmit = transport
        .poll_write()
        .ok_or(Error::Other("no transmit".to_owned()))?;
    assert_eq!(&transmit.message[..], b"world");
    Ok(())
}

#[test]
fn test_transport_ping_intervals() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;

    // pinged at `now` while connecting
    become_writable(&mut transport, socket, now)?;
    let ping_timer = transport.ping_timer.ok_or(Error::ErrWouldBlock)?;
    assert_eq!(
        transport.timers.deadline(ping_timer),
        Some(now + UNWRITABLE_PING_DELAY)
    );

    let next = now + UNWRITABLE_PING_DELAY;
    transport.handle_timeout(next)?;
    let (_, request) = pop_message(&mut transport)?;
    assert_eq!(request.typ, BINDING_REQUEST);
    let ping_timer = transport.ping_timer.ok_or(Error::ErrWouldBlock)?;
    assert_eq!(
        transport.timers.deadline(ping_timer),
        Some(next + WRITABLE_PING_DELAY)
    );
    Ok(())
}

#[test]
fn test_transport_unknown_address_with_unknown_username() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;
    let local_ufrag = transport.sessions()[0]
        .ports()
        .next()
        .ok_or(Error::ErrPortNotFound)?
        .username_fragment()
        .to_owned();

    let mut ping = Message::new(BINDING_REQUEST);
    Username::new(ATTR_USERNAME, format!("{local_ufrag}{REMOTE_UFRAG}")).add_to(&mut ping)?;
    inbound(&mut transport, socket, remote_addr(), &ping.marshal()?, now)?;

    let (context, response) = pop_message(&mut transport)?;
    assert_eq!(context.peer_addr, remote_addr());
    assert_eq!(response.typ, BINDING_ERROR_RESPONSE);
    let mut code = ErrorCodeAttribute::default();
    code.get_from(&response)?;
    assert_eq!(code.code, CODE_STALE_CREDENTIALS);
    assert_eq!(transport.connections().count(), 0);
    Ok(())
}

#[test]
fn test_transport_unknown_address_with_known_username() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;
    transport.add_remote_candidates(&[remote_candidate(remote_addr(), 0)], now);
    let local_ufrag = transport.sessions()[0]
        .ports()
        .next()
        .ok_or(Error::ErrPortNotFound)?
        .username_fragment()
        .to_owned();

    // the remote side pings from an address it never signaled
    let from: SocketAddr = "192.0.2.99:7000".parse().unwrap();
    let mut ping = Message::new(BINDING_REQUEST);
    Username::new(ATTR_USERNAME, format!("{local_ufrag}{REMOTE_UFRAG}")).add_to(&mut ping)?;
    inbound(&mut transport, socket, from, &ping.marshal()?, now)?;

    let (context, response) = pop_message(&mut transport)?;
    assert_eq!(context.peer_addr, from);
    assert_eq!(response.typ, BINDING_RESPONSE);
    assert_eq!(response.transaction_id, ping.transaction_id);

    assert_eq!(transport.connections().count(), 2);
    let conn = transport
        .connections()
        .find(|c| c.remote_candidate().address() == from)
        .ok_or(Error::ErrConnectionNotFound)?;
    assert_eq!(conn.read_state(), ReadState::Readable);
    assert_eq!(conn.remote_candidate().username(), REMOTE_UFRAG);
    assert!(transport.remote_candidates().any(|c| c.address() == from));
    Ok(())
}

#[test]
fn test_transport_loses_writability() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;
    become_writable(&mut transport, socket, now)?;
    drain_events(&mut transport);

    // without answers the connection degrades and a new allocation is asked
    // for; the previous session stays until its ports go away
    let mut t = now;
    let end = now + Duration::from_secs(40);
    let mut events = vec![];
    while t < end {
        t += Duration::from_millis(100);
        transport.handle_timeout(t)?;
        while transport.poll_write().is_some() {}
        events.extend(drain_events(&mut transport));
        if events.contains(&TransportEvent::RequestSignaling) {
            break;
        }
    }
    assert!(
        events.contains(&TransportEvent::RequestSignaling),
        "{events:?}"
    );
    assert!(events.contains(&TransportEvent::StateChange(TransportState::Connecting)));
    assert!(!transport.writable());

    transport.on_signaling_ready(t);
    assert_eq!(transport.sessions().len(), 2);
    assert_eq!(transport.sessions()[1].generation(), 1);
    // pinging already started, so the new session gets all ports right away
    assert!(transport.sessions()[1].is_getting_all_ports());
    Ok(())
}

#[test]
fn test_transport_reset() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;
    become_writable(&mut transport, socket, now)?;
    drain_events(&mut transport);

    transport.reset(now);
    assert!(transport.sessions().is_empty());
    assert_eq!(transport.connections().count(), 0);
    assert_eq!(transport.remote_candidates().count(), 0);
    assert!(transport.best_connection().is_none());
    assert_eq!(
        drain_events(&mut transport),
        vec![
            TransportEvent::StateChange(TransportState::Connecting),
            TransportEvent::RequestSignaling
        ]
    );
    assert_eq!(
        transport.poll_socket_request(),
        Some(SocketRequest::Close { socket })
    );
    Ok(())
}

#[test]
fn test_transport_close() -> Result<()> {
    let mut transport = new_transport();
    let now = Instant::now();
    let socket = start(&mut transport, now)?;

    transport.close()?;
    assert!(transport.sessions().is_empty());
    assert_eq!(transport.poll_timeout(), None);
    assert_eq!(
        transport.poll_socket_request(),
        Some(SocketRequest::Close { socket })
    );
    Ok(())
}
