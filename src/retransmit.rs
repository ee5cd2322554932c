// Stop-and-wait retransmission.
//
// Each step of a transfer sends one packet and waits for the one response that moves the transfer
// forward. Silence and unexpected responses are counted separately; either counter going past the
// policy's cap ends the exchange. Counters belong to the session that owns them and are reset
// every time the expected response arrives.

use crate::tftp::{self, ErrorCode, OpCode, Packet, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_RETRIES: u8 = 5;

/// How long to wait for a response and how often to resend before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u8,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { timeout: DEFAULT_TIMEOUT, max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// Retry bookkeeping for a single session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryCounters {
    /// Consecutive waits that ended without a datagram.
    pub timeouts: u8,
    /// Consecutive datagrams that were not the expected response.
    pub mismatches: u8,
}

impl RetryCounters {
    fn reset(&mut self) {
        *self = RetryCounters::default();
    }
}

/// The response that completes an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Ack(u16),
    Data(u16),
}

impl Expect {
    pub fn opcode(self) -> OpCode {
        match self {
            Expect::Ack(_) => OpCode::Ack,
            Expect::Data(_) => OpCode::Data,
        }
    }

    pub fn block(self) -> u16 {
        match self {
            Expect::Ack(block) | Expect::Data(block) => block,
        }
    }

    /// Checks the opcode and block number of a raw datagram.
    pub fn matches(self, buf: &[u8]) -> bool {
        tftp::decode_opcode(buf) == Some(self.opcode())
            && tftp::decode_block_number(buf) == Some(self.block())
    }
}

/// Why an exchange could not be completed.
#[derive(Debug)]
pub enum ExchangeFailure {
    /// The peer stayed silent through every retry.
    Timeout,
    /// The peer kept answering with something other than the expected packet.
    ProtocolError { expected: Expect },
    /// The peer gave up and told us why.
    PeerError { code: ErrorCode, message: String },
    /// The outbound packet could not be sent.
    Io(io::Error),
}

impl ExchangeFailure {
    /// The error to report to the peer, if any. Errors sent by the peer are never answered.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ExchangeFailure::Timeout => Some(ErrorCode::PrematureTermination),
            ExchangeFailure::ProtocolError { .. } | ExchangeFailure::Io(_) => {
                Some(ErrorCode::Undefined)
            }
            ExchangeFailure::PeerError { .. } => None,
        }
    }
}

impl error::Error for ExchangeFailure {}

impl fmt::Display for ExchangeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "Peer did not respond"),
            Self::ProtocolError { expected } => {
                write!(f, "Peer never sent the expected {:?}", expected)
            }
            Self::PeerError { code, message } => {
                write!(f, "Peer sent error {} ({:?}): '{}'", code.code(), code, message)
            }
            Self::Io(e) => write!(f, "Unable to send packet: {}", e),
        }
    }
}

/// What a single wait on the socket produced.
enum Response {
    Expected(Packet),
    PeerError(ErrorCode, String),
    Unexpected,
    Silence,
}

async fn await_response(sock: &TftpSocket, expect: Expect, ttl: Duration) -> Response {
    let buf = match sock.recv_with_timeout(ttl).await {
        Ok(buf) => buf,
        Err(SocketError::Timeout(_)) => return Response::Silence,
        Err(e) => {
            log::debug!("Receive from {} failed: {}", sock.peer(), e);
            return Response::Silence;
        }
    };

    if expect.matches(&buf) {
        return match Packet::parse_from_buf(&buf) {
            Ok(packet) => Response::Expected(packet),
            Err(e) => {
                log::debug!("Discarding malformed {:?} from {}: {}", expect, sock.peer(), e);
                Response::Unexpected
            }
        };
    }

    match Packet::parse_from_buf(&buf) {
        Ok(Packet::Error { code, message }) => Response::PeerError(code, message),
        Ok(packet) => {
            log::debug!("Expected {:?} from {}, got {:?}", expect, sock.peer(), packet);
            Response::Unexpected
        }
        Err(e) => {
            log::debug!("Expected {:?} from {}, got garbage: {}", expect, sock.peer(), e);
            Response::Unexpected
        }
    }
}

/// Sends `outbound` and waits for the response described by `expect`, resending `outbound` after
/// every timeout or unexpected response until one of the counters exceeds `policy.max_retries`.
pub async fn exchange(
    sock: &TftpSocket,
    outbound: &Packet,
    expect: Expect,
    policy: &RetryPolicy,
    counters: &mut RetryCounters,
) -> Result<Packet, ExchangeFailure> {
    let bytes = outbound.to_bytes();

    loop {
        sock.send_bytes(&bytes).await.map_err(|e| match e {
            SocketError::IO(e) => ExchangeFailure::Io(e),
            other => ExchangeFailure::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        })?;

        match await_response(sock, expect, policy.timeout).await {
            Response::Expected(packet) => {
                counters.reset();
                return Ok(packet);
            }
            Response::PeerError(code, message) => {
                return Err(ExchangeFailure::PeerError { code, message });
            }
            Response::Unexpected => {
                counters.mismatches = counters.mismatches.saturating_add(1);
                if counters.mismatches > policy.max_retries {
                    return Err(ExchangeFailure::ProtocolError { expected: expect });
                }
                log::debug!(
                    "Resending {:?} to {} (unexpected response {})",
                    outbound.opcode(),
                    sock.peer(),
                    counters.mismatches
                );
            }
            Response::Silence => {
                counters.timeouts = counters.timeouts.saturating_add(1);
                if counters.timeouts > policy.max_retries {
                    return Err(ExchangeFailure::Timeout);
                }
                log::debug!(
                    "Timed out waiting for {:?} from {}, resending (attempt {})",
                    expect,
                    sock.peer(),
                    counters.timeouts
                );
            }
        }
    }
}
