// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance, which works in roughly the following stages:
//
// 1. Bind a fresh socket and connect it to the peer. Everything after the initial request is
//    exchanged over this socket, so the peer sees replies coming from a new port.
// 2. Check whether the request can be serviced by opening the file. If it can't, the peer gets a
//    single error packet and the connection is closed.
// 3. Hand the socket and file to a TransferSession, which runs until the transfer completes or
//    aborts.

use crate::config::ServerConfig;
use crate::session::{self, Outcome, TransferSession};
use crate::tftp::{ErrorCode, Packet, Request, RequestKind, SocketError, TftpSocket};
use rand::Rng;
use std::error;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tokio::net::UdpSocket;

const MAX_BIND_ATTEMPTS: usize = 16;

/// Sends a single error packet and closes the socket. Delivery is best effort: the packet is never
/// retransmitted and send failures are only logged.
pub async fn signal_error(sock: TftpSocket, code: ErrorCode) {
    log::info!("Sending error {} ({:?}) to {}", code.code(), code, sock.peer());
    if let Err(e) = sock.send(&Packet::error(code)).await {
        log::warn!("Unable to send error packet to {}: {}", sock.peer(), e);
    }
}

/// Picks the local address for a transfer socket: the configured listen address, or the
/// unspecified address of the peer's family when listening on all interfaces.
fn local_ip_for(bind_ip: IpAddr, peer: SocketAddr) -> IpAddr {
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }
    match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Binds an OS-chosen port, or a random port from `ports`, retrying a few times on collisions.
async fn bind_ephemeral_socket(
    ip: IpAddr,
    ports: Option<&RangeInclusive<u16>>,
) -> io::Result<UdpSocket> {
    let Some(ports) = ports else {
        return UdpSocket::bind((ip, 0)).await;
    };

    let mut last_err = None;
    for _ in 0..MAX_BIND_ATTEMPTS {
        let port = rand::thread_rng().gen_range(ports.clone());
        match UdpSocket::bind((ip, port)).await {
            Ok(sock) => return Ok(sock),
            Err(e) => {
                log::warn!("Couldn't bind port {}: {}", port, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port available")))
}

/// Resolves a requested path against the served directory. A leading `/` is ignored.
fn resolve_path(root: &Path, requested: &str) -> PathBuf {
    root.join(requested.trim_start_matches('/'))
}

/// An object responsible for handling a request.
#[derive(Debug)]
pub struct ServerRequestHandler {
    session: TransferSession,
    kind: RequestKind,
    path: PathBuf,
}

impl ServerRequestHandler {
    pub async fn new(
        config: &ServerConfig,
        request: &Request,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let local_ip = local_ip_for(config.bind_ip, src);
        let sock = bind_ephemeral_socket(local_ip, config.ephemeral_ports.as_ref())
            .await
            .map_err(SocketError::from)?;
        let sock = TftpSocket::connect(sock, src).await?;
        log::debug!("Serving {} from {}", src, sock.local_addr()?);

        if request.mode != "octet" {
            log::debug!("Peer {} asked for {} mode, transferring as octet", src, request.mode);
        }

        let path = resolve_path(&config.root_dir, &request.path);
        let f = match session::open_file(request.kind, &path).await {
            Ok(f) => f,
            Err(e) => {
                let reason = ErrorCode::from(e.kind());
                log::warn!("Cannot open {} for {}: {}", path.display(), src, e);
                signal_error(sock, reason).await;
                return Err(ServerConnectionError::File { reason, error: e });
            }
        };

        Ok(ServerRequestHandler {
            session: TransferSession::new(sock, request.kind, f, config.retry),
            kind: request.kind,
            path,
        })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes.
    /// An upload that does not complete leaves no file behind, so the peer can retry it.
    pub async fn handle(self) -> Outcome {
        let outcome = self.session.run().await;
        if self.kind == RequestKind::Write && !matches!(outcome, Outcome::Completed { .. }) {
            let path = self.path.display();
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => log::info!("Removed partial upload {}", path),
                Err(e) => log::warn!("Couldn't remove partial upload {}: {}", path, e),
            }
        }
        outcome
    }
}

/// Serves one request from start to finish. Requests refused because of the file end as an
/// aborted session; only a failure to set up the socket is returned as an error.
pub async fn serve_request(
    config: &ServerConfig,
    request: &Request,
    src: SocketAddr,
) -> Result<Outcome, ServerConnectionError> {
    let verb = match request.kind {
        RequestKind::Read => "Read",
        RequestKind::Write => "Write",
    };
    log::info!("{} request for {} from {}", verb, request.path, src);

    match ServerRequestHandler::new(config, request, src).await {
        Ok(handler) => Ok(handler.handle().await),
        Err(ServerConnectionError::File { reason, .. }) => Ok(Outcome::Aborted { reason }),
        Err(e) => Err(e),
    }
}

#[derive(Debug)]
pub enum ServerConnectionError {
    Socket(SocketError),
    File { reason: ErrorCode, error: io::Error },
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "Unable to set up transfer socket: {}", e),
            Self::File { reason, error } => write!(f, "File IO error ({:?}): {}", reason, error),
        }
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}
