// Helpers shared by the socket-level tests.

use crate::retransmit::RetryPolicy;
use crate::tftp::{Packet, TftpSocket};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Two loopback sockets connected to each other: (server side, client side).
pub async fn socket_pair() -> (TftpSocket, TftpSocket) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();
    (
        TftpSocket::connect(a, b_addr).await.unwrap(),
        TftpSocket::connect(b, a_addr).await.unwrap(),
    )
}

/// Short timeouts so that retry exhaustion finishes quickly.
pub fn quick_policy() -> RetryPolicy {
    RetryPolicy { timeout: Duration::from_millis(50), max_retries: 5 }
}

/// Long enough that no retransmission happens while a test is responding.
pub fn patient_policy() -> RetryPolicy {
    RetryPolicy { timeout: Duration::from_secs(2), max_retries: 5 }
}

pub async fn try_recv_packet(sock: &TftpSocket, ttl: Duration) -> Option<Packet> {
    let raw = sock.recv_with_timeout(ttl).await.ok()?;
    Some(Packet::parse_from_buf(&raw).unwrap())
}

pub async fn recv_packet(sock: &TftpSocket) -> Packet {
    try_recv_packet(sock, Duration::from_secs(2))
        .await
        .expect("no packet arrived")
}
