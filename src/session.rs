// A transfer session moves one file between the server's disk and one peer.
//
// Read sessions push the file: read a block, send it as DATA, wait for its ACK, repeat until a
// block shorter than DATA_BUFFER_SIZE has been acknowledged. Write sessions pull the file: send
// the ACK for the previous block (0 to start), wait for the next DATA, append it, repeat until a
// short block arrives, then send one last ACK for it.
//
// Every step goes through retransmit::exchange, so the two directions share a single retry policy.
// Sessions own their socket, file and counters; nothing is shared with other sessions.

use crate::retransmit::{self, ExchangeFailure, Expect, RetryCounters, RetryPolicy};
use crate::srv_conn::signal_error;
use crate::tftp::{self, ErrorCode, Packet, RequestKind, TftpSocket};
use std::error;
use std::fmt;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingDispatch,
    Transferring,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every block was acknowledged.
    Completed { blocks: u64, bytes: u64 },
    /// The server gave up and sent the peer an error packet with `reason`.
    Aborted { reason: ErrorCode },
    /// The peer gave up first.
    PeerAborted { code: ErrorCode, message: String },
}

#[derive(Debug)]
pub enum TransferError {
    Exchange(ExchangeFailure),
    File(io::Error),
}

impl TransferError {
    /// The code reported to the peer when the session aborts.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            TransferError::Exchange(f) => f.error_code().unwrap_or(ErrorCode::Undefined),
            TransferError::File(_) => ErrorCode::Undefined,
        }
    }
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exchange(e) => write!(f, "{}", e),
            Self::File(e) => write!(f, "File IO error: {}", e),
        }
    }
}

impl From<ExchangeFailure> for TransferError {
    fn from(e: ExchangeFailure) -> TransferError {
        TransferError::Exchange(e)
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> TransferError {
        TransferError::File(e)
    }
}

/// Opens the file a request refers to. Write requests never replace an existing file.
pub async fn open_file(kind: RequestKind, path: &Path) -> Result<File, io::Error> {
    match kind {
        RequestKind::Read => {
            let f = File::open(path).await?;
            if f.metadata().await?.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is a directory", path.display()),
                ));
            }
            Ok(f)
        }
        RequestKind::Write => {
            log::info!("Writing to {}", path.display());
            OpenOptions::new().write(true).create_new(true).open(path).await
        }
    }
}

#[derive(Debug)]
pub struct TransferSession {
    sock: TftpSocket,
    kind: RequestKind,
    f: File,
    policy: RetryPolicy,
    counters: RetryCounters,
    /// Block being sent (reads) or last block received (writes).
    curr_block: u16,
    state: SessionState,
    blocks: u64,
    bytes: u64,
}

impl TransferSession {
    pub fn new(
        sock: TftpSocket,
        kind: RequestKind,
        f: File,
        policy: RetryPolicy,
    ) -> TransferSession {
        let curr_block = match kind {
            RequestKind::Read => 1,
            RequestKind::Write => 0,
        };
        TransferSession {
            sock,
            kind,
            f,
            policy,
            counters: RetryCounters::default(),
            curr_block,
            state: SessionState::AwaitingDispatch,
            blocks: 0,
            bytes: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(!self.state.is_terminal(), "session already ended");
        log::debug!("Session with {}: {:?} -> {:?}", self.sock.peer(), self.state, next);
        self.state = next;
    }

    /// Drives the transfer until it completes or aborts.
    pub async fn run(mut self) -> Outcome {
        self.transition(SessionState::Transferring);
        let result = match self.kind {
            RequestKind::Read => self.push_file().await,
            RequestKind::Write => self.pull_file().await,
        };

        match result {
            Ok(()) => {
                self.transition(SessionState::Completed);
                log::info!(
                    "Transfer with {} complete: {} blocks, {} bytes",
                    self.sock.peer(),
                    self.blocks,
                    self.bytes
                );
                Outcome::Completed { blocks: self.blocks, bytes: self.bytes }
            }
            Err(TransferError::Exchange(ExchangeFailure::PeerError { code, message })) => {
                self.transition(SessionState::Aborted);
                log::warn!(
                    "Peer {} ended the transfer at block {}: {:?} '{}'",
                    self.sock.peer(),
                    self.curr_block,
                    code,
                    message
                );
                Outcome::PeerAborted { code, message }
            }
            Err(e) => {
                self.transition(SessionState::Aborted);
                let reason = e.error_code();
                log::warn!(
                    "Aborting transfer with {} at block {}: {}",
                    self.sock.peer(),
                    self.curr_block,
                    e
                );
                signal_error(self.sock, reason).await;
                Outcome::Aborted { reason }
            }
        }
    }

    async fn push_file(&mut self) -> Result<(), TransferError> {
        loop {
            let data = read_block_from_file(&mut self.f).await?;
            let len = data.len();
            let packet = Packet::Data { block: self.curr_block, data };

            retransmit::exchange(
                &self.sock,
                &packet,
                Expect::Ack(self.curr_block),
                &self.policy,
                &mut self.counters,
            )
            .await?;

            self.blocks += 1;
            self.bytes += len as u64;
            log::debug!("Block {} acknowledged by {}", self.curr_block, self.sock.peer());

            if len < tftp::DATA_BUFFER_SIZE {
                return Ok(());
            }
            self.curr_block = self.curr_block.wrapping_add(1);
        }
    }

    async fn pull_file(&mut self) -> Result<(), TransferError> {
        loop {
            let next = self.curr_block.wrapping_add(1);
            let ack = Packet::Ack { block: self.curr_block };

            let packet = retransmit::exchange(
                &self.sock,
                &ack,
                Expect::Data(next),
                &self.policy,
                &mut self.counters,
            )
            .await?;
            let Packet::Data { data, .. } = packet else {
                return Err(ExchangeFailure::ProtocolError { expected: Expect::Data(next) }.into());
            };

            write_block_to_file(&mut self.f, &data).await?;
            self.curr_block = next;
            self.blocks += 1;
            self.bytes += data.len() as u64;
            log::debug!("Block {} received from {}", next, self.sock.peer());

            if data.len() < tftp::DATA_BUFFER_SIZE {
                // The final ACK is never retransmitted; a peer that loses it will time out on its
                // own.
                if let Err(e) = self.sock.send(&Packet::Ack { block: next }).await {
                    log::warn!("Unable to send final ack to {}: {}", self.sock.peer(), e);
                }
                return Ok(());
            }
        }
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return less than a full block before the end of the file.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

async fn write_block_to_file(f: &mut File, buf: &[u8]) -> Result<(), io::Error> {
    f.write_all(buf).await?;
    f.flush().await
}
