use bytes::BytesMut;
use clap::Parser;
use ice::allocator::{AllocatorConfig, BasicPortAllocator};
use ice::candidate::unmarshal_candidate;
use ice::network::Network;
use ice::socket::{SocketData, SocketEvent, SocketId, SocketNotice, SocketRequest};
use ice::transport::{Packet, Transport, TransportConfig, TransportEvent};
use log::{debug, info, warn};
use sansio::Protocol;
use shared::error::{Error, Result};
use shared::{TransportContext, TransportMessage, TransportProtocol};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// Two transports in one process, connected over real UDP sockets on the
// loopback interface:
//      cargo run --package p2p-demos --example loopback -- --debug

#[derive(Parser)]
#[command(name = "P2P Loopback")]
#[command(version = "0.1.0")]
#[command(about = "Connects two transports over loopback UDP sockets", long_about = None)]
struct Cli {
    /// Number of ping/pong rounds before exiting.
    #[arg(short, long, default_value_t = 5)]
    count: usize,
    #[arg(short, long, default_value_t = format!("127.0.0.1"))]
    ip: String,

    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

/// A datagram read by one of the socket tasks.
struct Datagram {
    peer: usize,
    socket: SocketId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    data: BytesMut,
}

struct BoundSocket {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

struct Peer {
    index: usize,
    transport: Transport,
    sockets: HashMap<SocketId, BoundSocket>,
    /// Candidates to deliver to the other peer, as signaled text.
    signals: Vec<String>,
}

impl Peer {
    fn new(index: usize, ip: IpAddr) -> Self {
        let mut allocator = BasicPortAllocator::new(AllocatorConfig {
            disable_tcp: true,
            disable_relay: true,
            ..Default::default()
        });
        allocator.set_networks(vec![Network::new("lo", ip)]);
        Self {
            index,
            transport: Transport::new("data", allocator, TransportConfig::default()),
            sockets: HashMap::new(),
            signals: vec![],
        }
    }

    async fn bind(
        &mut self,
        socket: SocketId,
        local_addr: SocketAddr,
        tx: &mpsc::Sender<Datagram>,
    ) -> Result<()> {
        let udp = match UdpSocket::bind(local_addr).await {
            Ok(udp) => Arc::new(udp),
            Err(err) => {
                return self.transport.handle_event(SocketNotice {
                    now: Instant::now(),
                    event: SocketEvent::Error {
                        socket,
                        reason: err.to_string(),
                    },
                });
            }
        };
        let bound_addr = udp.local_addr()?;
        debug!("peer {}: socket {} bound to {}", self.index, socket, bound_addr);

        let reader = Arc::clone(&udp);
        let tx = tx.clone();
        let peer = self.index;
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer_addr)) = reader.recv_from(&mut buf).await {
                let datagram = Datagram {
                    peer,
                    socket,
                    local_addr: bound_addr,
                    peer_addr,
                    data: BytesMut::from(&buf[..n]),
                };
                if tx.send(datagram).await.is_err() {
                    break;
                }
            }
        });
        self.sockets.insert(
            socket,
            BoundSocket {
                socket: udp,
                reader: handle,
            },
        );

        self.transport.handle_event(SocketNotice {
            now: Instant::now(),
            event: SocketEvent::Bound {
                socket,
                local_addr: bound_addr,
            },
        })
    }

    /// Serves socket requests, reacts to transport events and flushes
    /// datagrams until the transport has nothing more to say. Returns the
    /// application payloads read.
    async fn drive(&mut self, tx: &mpsc::Sender<Datagram>) -> Result<Vec<BytesMut>> {
        let mut idle = false;
        while !idle {
            idle = true;
            while let Some(request) = self.transport.poll_socket_request() {
                idle = false;
                match request {
                    SocketRequest::BindUdp { socket, local_addr } => {
                        self.bind(socket, local_addr, tx).await?
                    }
                    SocketRequest::Close { socket } => {
                        if let Some(bound) = self.sockets.remove(&socket) {
                            bound.reader.abort();
                        }
                    }
                    other => warn!("peer {}: unsupported request {:?}", self.index, other),
                }
            }

            while let Some(event) = self.transport.poll_event() {
                idle = false;
                match event {
                    TransportEvent::RequestSignaling => {
                        self.transport.on_signaling_ready(Instant::now())
                    }
                    TransportEvent::CandidatesReady(candidates) => {
                        for c in candidates {
                            let signal = c.marshal();
                            println!("peer {}: candidate {}", self.index, signal);
                            self.signals.push(signal);
                        }
                    }
                    TransportEvent::StateChange(state) => {
                        println!("peer {}: transport is {}", self.index, state);
                    }
                    TransportEvent::BestConnectionChanged(addr) => {
                        println!("peer {}: best connection to {}", self.index, addr);
                    }
                }
            }

            while let Some(transmit) = self.transport.poll_write() {
                let bound = self
                    .sockets
                    .values()
                    .find(|b| b.socket.local_addr().ok() == Some(transmit.transport.local_addr));
                match bound {
                    Some(bound) => {
                        bound
                            .socket
                            .send_to(&transmit.message, transmit.transport.peer_addr)
                            .await?;
                    }
                    None => warn!(
                        "peer {}: no socket on {}",
                        self.index, transmit.transport.local_addr
                    ),
                }
            }
        }

        let mut reads = vec![];
        while let Some(Packet { data, .. }) = self.transport.poll_read() {
            reads.push(data);
        }
        Ok(reads)
    }

    fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        for (_, bound) in self.sockets.drain() {
            bound.reader.abort();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.debug {
        let log_level = log::LevelFilter::from_str(&cli.log_level)
            .map_err(|err| Error::Other(err.to_string()))?;
        env_logger::Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{}:{} [{}] {} - {}",
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    record.level(),
                    chrono::Local::now().format("%H:%M:%S.%6f"),
                    record.args()
                )
            })
            .filter(None, log_level)
            .init();
    }

    let ip = IpAddr::from_str(&cli.ip)?;
    let (done_tx, mut done_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        let _ = done_tx.send(());
    })
    .map_err(|err| Error::Other(err.to_string()))?;

    let (tx, mut rx) = mpsc::channel::<Datagram>(64);
    let mut peers = [Peer::new(0, ip), Peer::new(1, ip)];
    for peer in peers.iter_mut() {
        peer.transport.start_processing_candidates(Instant::now());
    }

    let mut round = 0;
    let mut next_ping = Instant::now();
    loop {
        for i in 0..2 {
            for data in peers[i].drive(&tx).await? {
                let text = String::from_utf8_lossy(&data).to_string();
                println!("peer {i}: received {text}");
                if i == 1 {
                    let reply = text.replace("ping", "pong");
                    if let Err(err) = peers[1].transport.send(reply.as_bytes(), Instant::now()) {
                        warn!("peer 1: failed to reply: {}", err);
                    }
                }
            }

            // signaling is a direct hand-over in this demo
            let signals = std::mem::take(&mut peers[i].signals);
            let mut candidates = vec![];
            for signal in signals {
                match unmarshal_candidate(&signal) {
                    Ok(c) => candidates.push(c),
                    Err(err) => warn!("peer {}: bad candidate {}: {}", 1 - i, signal, err),
                }
            }
            if !candidates.is_empty() {
                peers[1 - i]
                    .transport
                    .add_remote_candidates(&candidates, Instant::now());
            }
        }

        if peers.iter().all(|p| p.transport.writable()) && Instant::now() >= next_ping {
            if round == cli.count {
                break;
            }
            round += 1;
            let msg = format!("ping {round}");
            info!("sending {}", msg);
            peers[0].transport.send(msg.as_bytes(), Instant::now())?;
            next_ping = Instant::now() + Duration::from_secs(1);
            continue;
        }

        let mut deadline = Instant::now() + Duration::from_millis(100);
        for peer in peers.iter_mut() {
            if let Some(t) = peer.transport.poll_timeout() {
                deadline = deadline.min(t);
            }
        }
        let timeout = tokio::time::sleep(deadline.saturating_duration_since(Instant::now()));
        tokio::pin!(timeout);

        tokio::select! {
            _ = done_rx.changed() => {
                println!("exit loopback loop");
                break;
            }
            _ = timeout.as_mut() => {
                let now = Instant::now();
                for peer in peers.iter_mut() {
                    if peer.transport.poll_timeout().is_some_and(|t| t <= now) {
                        peer.transport.handle_timeout(now)?;
                    }
                }
            }
            res = rx.recv() => {
                let Some(datagram) = res else {
                    break;
                };
                let peer = &mut peers[datagram.peer];
                if let Err(err) = peer.transport.handle_read(SocketData {
                    socket: datagram.socket,
                    msg: TransportMessage {
                        now: Instant::now(),
                        transport: TransportContext {
                            local_addr: datagram.local_addr,
                            peer_addr: datagram.peer_addr,
                            transport_protocol: TransportProtocol::UDP,
                        },
                        message: datagram.data,
                    },
                }) {
                    warn!("peer {}: {}", datagram.peer, err);
                }
            }
        }
    }

    for peer in peers.iter_mut() {
        peer.close()?;
    }
    Ok(())
}
