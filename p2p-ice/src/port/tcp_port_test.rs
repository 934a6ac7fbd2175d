use super::*;
use crate::candidate::CandidateConfig;
use crate::connection::WriteState;

fn listen_addr() -> SocketAddr {
    "10.0.0.1:41000".parse().unwrap()
}

fn new_tcp_port(local_addr: &str) -> Port {
    let base = PortBase::new(
        PortId {
            session: 0,
            index: 2,
        },
        CandidateType::Local,
        Network::new("eth0", "10.0.0.1".parse().unwrap()),
    );
    let mut port = Port::new(base, PortKind::Tcp(TcpPort::new(local_addr.parse().unwrap())));
    port.set_name("rtp");
    port.set_preference(0.8);
    port
}

fn listen(port: &mut Port, now: Instant) -> Result<SocketId> {
    port.prepare_address(now);
    let request = port
        .poll_socket_request()
        .ok_or(Error::Other("no socket request".to_owned()))?;
    assert!(matches!(request, SocketRequest::ListenTcp { .. }));
    port.handle_socket_event(
        SocketEvent::Bound {
            socket: request.socket(),
            local_addr: listen_addr(),
        },
        now,
    );
    Ok(request.socket())
}

fn tcp_candidate(addr: &str, protocol: ProtocolType) -> Candidate {
    Candidate::from(CandidateConfig {
        name: "rtp".to_owned(),
        candidate_type: CandidateType::Local,
        protocol,
        address: addr.parse().unwrap(),
        preference: 0.8,
        username: "remotefragment00".to_owned(),
        password: "remotepassword00".to_owned(),
        network_name: "eth0".to_owned(),
        generation: 0,
    })
}

#[test]
fn test_tcp_port_listens() -> Result<()> {
    let mut port = new_tcp_port("10.0.0.1:0");
    let now = Instant::now();
    listen(&mut port, now)?;

    assert!(matches!(port.poll_event(), Some(PortEvent::AddressReady)));
    assert_eq!(port.candidates().len(), 1);
    assert_eq!(port.candidates()[0].address(), listen_addr());
    assert_eq!(port.candidates()[0].protocol(), ProtocolType::Tcp);
    Ok(())
}

#[test]
fn test_tcp_port_origin_rules() -> Result<()> {
    let now = Instant::now();

    let mut port = new_tcp_port("10.0.0.1:0");
    listen(&mut port, now)?;
    let udp = tcp_candidate("10.0.0.2:5000", ProtocolType::Udp);
    assert_eq!(port.create_connection(&udp, CandidateOrigin::Message, now), None);
    let tcp = tcp_candidate("10.0.0.2:5000", ProtocolType::Tcp);
    assert_eq!(port.create_connection(&tcp, CandidateOrigin::OtherPort, now), None);
    let ssltcp = tcp_candidate("10.0.0.2:5001", ProtocolType::SslTcp);
    assert_eq!(port.create_connection(&ssltcp, CandidateOrigin::ThisPort, now), None);
    assert!(port
        .create_connection(&ssltcp, CandidateOrigin::Message, now)
        .is_some());

    // a fixed listening port never dials out
    let mut port = new_tcp_port("10.0.0.1:41000");
    listen(&mut port, now)?;
    assert_eq!(port.create_connection(&tcp, CandidateOrigin::Message, now), None);
    Ok(())
}

#[test]
fn test_tcp_port_outgoing_stream() -> Result<()> {
    let mut port = new_tcp_port("10.0.0.1:0");
    let now = Instant::now();
    listen(&mut port, now)?;
    while port.poll_event().is_some() {}

    let remote = tcp_candidate("10.0.0.2:5000", ProtocolType::Tcp);
    port.create_connection(&remote, CandidateOrigin::Message, now)
        .ok_or(Error::ErrConnectionNotFound)?;

    let socket = match port.poll_socket_request() {
        Some(SocketRequest::ConnectTcp {
            socket,
            local_addr,
            remote_addr,
            ssl,
            ..
        }) => {
            assert_eq!(local_addr, "10.0.0.1:0".parse().unwrap());
            assert_eq!(remote_addr, remote.address());
            assert!(!ssl);
            socket
        }
        other => panic!("unexpected {other:?}"),
    };

    let conn = port
        .connection(&remote.address())
        .ok_or(Error::ErrConnectionNotFound)?;
    assert!(!conn.connected());
    assert_eq!(
        port.send_to(b"early", remote.address(), false, now),
        Err(Error::ErrWouldBlock)
    );

    let stream_addr: SocketAddr = "10.0.0.1:52000".parse().unwrap();
    port.handle_socket_event(
        SocketEvent::Connected {
            socket,
            local_addr: stream_addr,
        },
        now,
    );
    let conn = port
        .connection(&remote.address())
        .ok_or(Error::ErrConnectionNotFound)?;
    assert!(conn.connected());

    port.ping(remote.address(), now)?;
    let t = port.poll_transmit().ok_or(Error::ErrWouldBlock)?;
    assert_eq!(t.transport.local_addr, stream_addr);
    assert_eq!(t.transport.peer_addr, remote.address());
    assert_eq!(t.transport.transport_protocol, TransportProtocol::TCP);
    assert_eq!(sorted(port.sockets()), sorted(vec![socket, listen_socket(&port)]));
    Ok(())
}

fn sorted(mut sockets: Vec<SocketId>) -> Vec<SocketId> {
    sockets.sort();
    sockets
}

fn listen_socket(port: &Port) -> SocketId {
    SocketId {
        port: port.id(),
        index: 0,
    }
}

#[test]
fn test_tcp_port_stream_closed() -> Result<()> {
    let mut port = new_tcp_port("10.0.0.1:0");
    let now = Instant::now();
    listen(&mut port, now)?;
    let remote = tcp_candidate("10.0.0.2:5000", ProtocolType::Tcp);
    let id = port
        .create_connection(&remote, CandidateOrigin::Message, now)
        .ok_or(Error::ErrConnectionNotFound)?;
    let socket = port
        .poll_socket_request()
        .ok_or(Error::ErrSocketNotFound)?
        .socket();
    port.handle_socket_event(
        SocketEvent::Connected {
            socket,
            local_addr: "10.0.0.1:52000".parse().unwrap(),
        },
        now,
    );
    while port.poll_event().is_some() {}

    port.handle_socket_event(
        SocketEvent::Closed {
            socket,
            peer_addr: None,
        },
        now,
    );

    // a lost stream times the connection out for writing, and an unreadable
    // one is removed
    let mut destroyed = false;
    while let Some(event) = port.poll_event() {
        if let PortEvent::ConnectionDestroyed(destroyed_id) = event {
            assert_eq!(destroyed_id, id);
            destroyed = true;
        }
    }
    assert!(destroyed);
    assert!(port.connection(&remote.address()).is_none());
    assert_eq!(port.sockets(), vec![listen_socket(&port)]);
    Ok(())
}

#[test]
fn test_tcp_port_accepted_stream() -> Result<()> {
    let mut port = new_tcp_port("10.0.0.1:41000");
    let now = Instant::now();
    let listener = listen(&mut port, now)?;
    let peer: SocketAddr = "10.0.0.2:60000".parse().unwrap();
    port.handle_socket_event(
        SocketEvent::Accepted {
            listener,
            peer_addr: peer,
        },
        now,
    );

    // pings on the accepted stream may be answered before a connection exists
    assert_eq!(port.send_to(b"stun", peer, false, now), Ok(4));
    let t = port.poll_transmit().ok_or(Error::ErrWouldBlock)?;
    assert_eq!(t.transport.local_addr, listen_addr());

    let remote = tcp_candidate("10.0.0.2:60000", ProtocolType::Tcp);
    port.create_connection(&remote, CandidateOrigin::ThisPort, now)
        .ok_or(Error::ErrConnectionNotFound)?;
    // no new stream is opened
    assert!(port.poll_socket_request().is_none());
    let conn = port.connection(&peer).ok_or(Error::ErrConnectionNotFound)?;
    assert!(conn.connected());
    assert_eq!(conn.write_state(), WriteState::WriteConnect);

    assert_eq!(
        port.send_to(b"data", "10.0.0.9:9".parse().unwrap(), false, now),
        Err(Error::ErrUnknownDestination)
    );

    port.handle_socket_event(
        SocketEvent::Closed {
            socket: listener,
            peer_addr: Some(peer),
        },
        now,
    );
    assert!(port.connection(&peer).is_none());
    Ok(())
}

#[test]
fn test_tcp_port_destroyed_connection_closes_stream() -> Result<()> {
    let mut port = new_tcp_port("10.0.0.1:0");
    let now = Instant::now();
    listen(&mut port, now)?;
    let remote = tcp_candidate("10.0.0.2:5000", ProtocolType::Tcp);
    port.create_connection(&remote, CandidateOrigin::Message, now);
    let socket = port
        .poll_socket_request()
        .ok_or(Error::ErrSocketNotFound)?
        .socket();

    port.destroy_connection(remote.address(), now);
    assert_eq!(
        port.poll_socket_request(),
        Some(SocketRequest::Close { socket })
    );
    Ok(())
}
