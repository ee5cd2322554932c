//! The well-known port. Receives initial requests and starts one task per request; the
//! transfer itself never touches this socket.

use crate::config::ServerConfig;
use crate::srv_conn;
use crate::tftp;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

#[derive(Debug)]
pub struct RequestListener {
    socket: UdpSocket,
    config: Arc<ServerConfig>,
}

impl RequestListener {
    pub async fn bind(config: ServerConfig) -> Result<RequestListener> {
        let addr = SocketAddr::new(config.bind_ip, config.port);
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind TFTP server socket on {addr}"))?;

        Ok(RequestListener { socket, config: Arc::new(config) })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to get local address")
    }

    /// Receives requests forever. Individual bad datagrams and failed transfers never stop the
    /// loop.
    pub async fn serve(self) -> Result<()> {
        log::info!(
            "Listening at {}, serving {}",
            self.local_addr()?,
            self.config.root_dir.display()
        );

        let mut buf = [0u8; tftp::MAX_PACKET_SIZE];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("Couldn't receive request: {}", e);
                    continue;
                }
            };

            let request = match tftp::decode_request(&buf[..len]) {
                Ok(request) => request,
                Err(e) => {
                    log::debug!("Ignoring datagram from {}: {}", src, e);
                    continue;
                }
            };

            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                match srv_conn::serve_request(&config, &request, src).await {
                    Ok(outcome) => log::debug!("{} for {} ended: {:?}", request.path, src, outcome),
                    Err(e) => log::warn!("Couldn't serve {} for {}: {}", request.path, src, e),
                }
            });
        }
    }
}
