use bytes::BytesMut;
use clap::Parser;
use ice::allocator::{AllocatorConfig, BasicPortAllocator, Session, SessionEvent};
use ice::network::Network;
use ice::socket::{SocketData, SocketEvent, SocketId, SocketNotice, SocketRequest};
use log::{debug, warn};
use sansio::Protocol;
use shared::error::{Error, Result};
use shared::{TransportContext, TransportMessage, TransportProtocol};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// Prints the candidates an allocator session gathers on the given addresses:
//      cargo run --package p2p-demos --example gather -- --ip 192.168.1.10 --stun-server 203.0.113.1:3478

#[derive(Parser)]
#[command(name = "P2P Gather")]
#[command(version = "0.1.0")]
#[command(about = "Gathers local candidates with an allocator session", long_about = None)]
struct Cli {
    /// Local address to allocate on; repeat for several networks.
    #[arg(short, long, default_values_t = vec![format!("127.0.0.1")])]
    ip: Vec<String>,
    #[arg(short, long)]
    stun_server: Option<String>,
    #[arg(long)]
    disable_tcp: bool,
    /// Seconds to gather for.
    #[arg(long, default_value_t = 5)]
    duration: u64,

    #[arg(short, long)]
    debug: bool,
    #[arg(long, default_value_t = format!("INFO"))]
    log_level: String,
}

struct Datagram {
    socket: SocketId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    data: BytesMut,
}

enum Bound {
    Udp {
        socket: Arc<UdpSocket>,
        local_addr: SocketAddr,
        reader: JoinHandle<()>,
    },
    // held open so the port stays reachable
    Tcp { _listener: TcpListener },
}

struct Gatherer {
    session: Session,
    sockets: HashMap<SocketId, Bound>,
    tx: mpsc::Sender<Datagram>,
}

impl Gatherer {
    async fn bind_udp(&mut self, socket: SocketId, local_addr: SocketAddr) -> Result<SocketEvent> {
        let udp = Arc::new(UdpSocket::bind(local_addr).await?);
        let bound_addr = udp.local_addr()?;
        let reader = Arc::clone(&udp);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            while let Ok((n, peer_addr)) = reader.recv_from(&mut buf).await {
                let datagram = Datagram {
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
            Bound::Udp {
                socket: udp,
                local_addr: bound_addr,
                reader: handle,
            },
        );
        Ok(SocketEvent::Bound {
            socket,
            local_addr: bound_addr,
        })
    }

    async fn listen_tcp(&mut self, socket: SocketId, local_addr: SocketAddr) -> Result<SocketEvent> {
        let listener = TcpListener::bind(local_addr).await?;
        let bound_addr = listener.local_addr()?;
        self.sockets.insert(
            socket,
            Bound::Tcp {
                _listener: listener,
            },
        );
        Ok(SocketEvent::Bound {
            socket,
            local_addr: bound_addr,
        })
    }

    async fn serve(&mut self, request: SocketRequest) -> Result<()> {
        debug!("socket request {:?}", request);
        let socket = request.socket();
        let result = match request {
            SocketRequest::BindUdp { local_addr, .. } => self.bind_udp(socket, local_addr).await,
            SocketRequest::ListenTcp { local_addr, .. } => {
                self.listen_tcp(socket, local_addr).await
            }
            SocketRequest::ConnectTcp { remote_addr, .. } => Err(Error::Other(format!(
                "outgoing TCP to {remote_addr} is not supported here"
            ))),
            SocketRequest::Close { socket } => {
                if let Some(Bound::Udp { reader, .. }) = self.sockets.remove(&socket) {
                    reader.abort();
                }
                return Ok(());
            }
        };
        let event = result.unwrap_or_else(|err| SocketEvent::Error {
            socket,
            reason: err.to_string(),
        });
        self.session.handle_event(SocketNotice {
            now: Instant::now(),
            event,
        })
    }

    /// Runs socket requests and prints gathered candidates until the session
    /// goes quiet.
    async fn drive(&mut self) -> Result<()> {
        let mut idle = false;
        while !idle {
            idle = true;
            while let Some(request) = self.session.poll_socket_request() {
                idle = false;
                self.serve(request).await?;
            }

            while let Some(event) = self.session.poll_event() {
                idle = false;
                match event {
                    SessionEvent::CandidatesReady(candidates) => {
                        for c in candidates {
                            println!("{c}");
                        }
                    }
                    SessionEvent::PortDestroyed(port) => println!("port {port} destroyed"),
                    other => debug!("session event {:?}", other),
                }
            }

            while let Some(transmit) = self.session.poll_write() {
                let socket = self.sockets.values().find_map(|bound| match bound {
                    Bound::Udp {
                        socket, local_addr, ..
                    } if *local_addr == transmit.transport.local_addr => Some(socket),
                    _ => None,
                });
                match socket {
                    Some(socket) => {
                        socket
                            .send_to(&transmit.message, transmit.transport.peer_addr)
                            .await?;
                    }
                    None => warn!("no socket on {}", transmit.transport.local_addr),
                }
            }
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

    let mut networks = vec![];
    for (i, ip) in cli.ip.iter().enumerate() {
        networks.push(Network::new(format!("net{i}"), IpAddr::from_str(ip)?));
    }
    let stun_server = match &cli.stun_server {
        Some(addr) => Some(SocketAddr::from_str(addr)?),
        None => None,
    };

    let mut allocator = BasicPortAllocator::new(AllocatorConfig {
        disable_tcp: cli.disable_tcp,
        disable_relay: true,
        stun_server,
        ..Default::default()
    });
    allocator.set_networks(networks);

    let (done_tx, mut done_rx) = watch::channel(());
    ctrlc::set_handler(move || {
        let _ = done_tx.send(());
    })
    .map_err(|err| Error::Other(err.to_string()))?;

    let (tx, mut rx) = mpsc::channel::<Datagram>(64);
    let mut gatherer = Gatherer {
        session: allocator.create_session("data"),
        sockets: HashMap::new(),
        tx,
    };
    let now = Instant::now();
    gatherer.session.get_initial_ports(now);
    gatherer.session.start_get_all_ports(now);

    let end = now + Duration::from_secs(cli.duration);
    loop {
        gatherer.drive().await?;

        let mut deadline = end;
        if let Some(t) = gatherer.session.poll_timeout() {
            deadline = deadline.min(t);
        }
        let timeout = tokio::time::sleep(deadline.saturating_duration_since(Instant::now()));
        tokio::pin!(timeout);

        tokio::select! {
            _ = done_rx.changed() => break,
            _ = timeout.as_mut() => {
                let now = Instant::now();
                if now >= end {
                    break;
                }
                gatherer.session.handle_timeout(now)?;
            }
            res = rx.recv() => {
                let Some(datagram) = res else {
                    break;
                };
                if let Err(err) = gatherer.session.handle_read(SocketData {
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
                    warn!("{}", err);
                }
            }
        }
    }

    gatherer.session.close()?;
    gatherer.drive().await?;
    Ok(())
}
