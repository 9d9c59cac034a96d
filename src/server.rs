//! Listener and per-connection relay pipeline
//!
//! One task per accepted connection: sniff the protocol, parse its
//! handshake, open the outbound connection (directly or framed through the
//! configured upstream chain), flush any inline payload, then pump bytes
//! both ways until either side closes. Every failure is caught at the task
//! boundary; the listener and all other connections are unaffected.

use std::{io, net::SocketAddr, sync::Arc};

use futures::future::{self, Either};
use log::{debug, error, info, trace};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
};

use crate::{
    config::ServerConfig,
    proto::{self, http, sniff, ClientStream, ConnContext, RelayMode, SniffError},
    relay::{
        channel, Address, ConnectionGuard, Direction, FlowStat, RelayRead, RelayWrite, SharedFlowStat,
    },
};

/// The protocol-sniffing proxy server
pub struct Server {
    config: Arc<ServerConfig>,
    flow: SharedFlowStat,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server {
            config: Arc::new(config),
            flow: FlowStat::new_shared(),
        }
    }

    /// Shared statistics handle, readable while the server runs
    pub fn flow_stat(&self) -> SharedFlowStat {
        self.flow.clone()
    }

    /// Bind and serve until the listener fails
    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(self.config.listen).await?;
        let local_addr = listener.local_addr()?;

        let names: Vec<&str> = self.config.protos.iter().map(|p| p.name()).collect();
        info!("listening on {}, protocols [{}]", local_addr, names.join(", "));

        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("accept failed: {}", err);
                    continue;
                }
            };

            let config = self.config.clone();
            let flow = self.flow.clone();
            tokio::spawn(async move {
                let _guard = ConnectionGuard::new(flow.clone());
                if let Err(err) = serve_connection(config, socket, peer_addr, flow).await {
                    debug!("connection {} closed: {}", peer_addr, err);
                }
            });
        }
    }
}

async fn connect_target(addr: &Address) -> io::Result<TcpStream> {
    match *addr {
        Address::SocketAddress(sa) => TcpStream::connect(sa).await,
        Address::DomainNameAddress(ref host, port) => TcpStream::connect((host.as_str(), port)).await,
    }
}

async fn serve_connection(
    config: Arc<ServerConfig>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    flow: SharedFlowStat,
) -> io::Result<()> {
    let local_addr = socket.local_addr()?;
    let mut client = BufReader::new(socket);
    let mut ctx = ConnContext::new(peer_addr, local_addr, config.auth.clone(), config.httpget.clone());

    let (protocol, header) = match sniff(&config.protos, &mut client, &config.auth).await {
        Ok(selected) => selected,
        Err(SniffError::ConnectionClosed) => {
            trace!("{} disconnected before sending anything", peer_addr);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let handshake = protocol.parse(header, &mut client, &mut ctx).await?;
    debug!(
        "{} relay {} -> {} established",
        protocol.name(),
        peer_addr,
        handshake.addr
    );

    // Outbound: either straight to the destination or framed through the
    // configured chain hop. Single shot, no retry.
    let (upstream, ota_out) = match config.upstream {
        Some(ref up) => {
            let socket = connect_target(&up.addr).await?;
            let mut upstream = BufReader::new(socket);
            let ota = up.proto.connect(&mut upstream, &up.auth, &handshake.addr).await?;
            (upstream, ota)
        }
        None => {
            let socket = connect_target(&handshake.addr).await?;
            (BufReader::new(socket), None)
        }
    };

    relay(client, upstream, handshake, ota_out, flow, peer_addr).await
}

async fn relay(
    client: ClientStream,
    upstream: ClientStream,
    handshake: proto::Handshake,
    ota_out: Option<proto::shadow::OtaSigner>,
    flow: SharedFlowStat,
    peer_addr: SocketAddr,
) -> io::Result<()> {
    let target = handshake.addr;

    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let mut up_write = match ota_out {
        Some(signer) => RelayWrite::Ota(upstream_write, signer),
        None => RelayWrite::Plain(upstream_write),
    };

    // Inline payload consumed with the handshake goes out first, through the
    // same transform as the relay that follows
    if !handshake.payload.is_empty() {
        up_write.write_chunk(&handshake.payload).await?;
    }

    let down = channel(
        RelayRead::Plain(upstream_read),
        RelayWrite::Plain(client_write),
        flow.clone(),
        Direction::UpstreamToClient,
    );

    match handshake.mode {
        RelayMode::Tunnel => {
            let up_read = match handshake.ota {
                Some(verifier) => RelayRead::Ota(client_read, verifier),
                None => RelayRead::Plain(client_read),
            };
            let up = channel(up_read, up_write, flow.clone(), Direction::ClientToUpstream);

            tokio::pin!(up);
            tokio::pin!(down);
            log_relay_end(future::select(up, down).await, peer_addr, &target);
        }
        RelayMode::HttpForward => {
            let up = http::forward_channel(client_read, up_write, flow.clone());

            tokio::pin!(up);
            tokio::pin!(down);
            log_relay_end(future::select(up, down).await, peer_addr, &target);
        }
    }

    Ok(())
}

fn log_relay_end<A, B>(
    result: Either<(io::Result<()>, A), (io::Result<()>, B)>,
    peer_addr: SocketAddr,
    target: &Address,
) {
    match result {
        Either::Left((Ok(..), ..)) => {
            trace!("relay {} -> {} closed", peer_addr, target);
        }
        Either::Left((Err(err), ..)) => {
            trace!("relay {} -> {} closed with error: {}", peer_addr, target, err);
        }
        Either::Right((Ok(..), ..)) => {
            trace!("relay {} <- {} closed", peer_addr, target);
        }
        Either::Right((Err(err), ..)) => {
            trace!("relay {} <- {} closed with error: {}", peer_addr, target, err);
        }
    }
}
