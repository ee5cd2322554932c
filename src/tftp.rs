// Wire format and transport for the server.
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ:  0x01/0x02 | Filename | 0x00 | Mode | 0x00
// DATA:     0x03 | Block # (2 bytes) | Data (0-512 bytes)
// ACK:      0x04 | Block # (2 bytes)
// ERROR:    0x05 | ErrorCode (2 bytes) | ErrMsg
//
// The mode string is read but never acted upon: every transfer is octet. Error messages are sent
// without a terminating null byte, and a trailing null byte on a received one is dropped.

use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Size of the payload carried by a full data block. Anything shorter ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode and block number.
pub const HEADER_SIZE: usize = 4;

/// The largest datagram the server ever needs to receive.
pub const MAX_PACKET_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// The operation carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }

    pub fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
    PrematureTermination,
}

impl ErrorCode {
    /// The numeric code put on the wire.
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
            ErrorCode::PrematureTermination => 8,
        }
    }

    /// The fixed human-readable message sent alongside the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined",
            ErrorCode::FileNotFound => "Requested file not found",
            ErrorCode::AccessViolation => "Access violation occurred",
            ErrorCode::DiskFull => "Disk full or quota exceeded",
            ErrorCode::Illegal => "Illegal TFTP operation",
            ErrorCode::UnknownTid => "Unknown port number",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::PrematureTermination => "Premature termination",
        }
    }

    /// Codes outside of the known set are reported as `Undefined`.
    pub fn from_code(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::PrematureTermination,
            _ => ErrorCode::Undefined,
        }
    }
}

/// Maps the reason a requested file could not be opened onto the code reported to the peer.
impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            _ => ErrorCode::AccessViolation,
        }
    }
}

/// Which way the file travels in a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// The peer reads a file from the server's disk.
    Read,
    /// The peer writes a file onto the server's disk.
    Write,
}

/// An initial request, as received on the well-known port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub path: String,
    pub mode: String,
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The transfer mode named by the client.
        mode: String,
    },

    /// A write request packet
    WriteReq { path: String, mode: String },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string. The bytes are decoded as UTF-8;
/// invalid sequences become U+FFFD.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

/// Returns the opcode of a raw packet, if it has a known one.
pub fn decode_opcode(buf: &[u8]) -> Option<OpCode> {
    if buf.len() < 2 {
        return None;
    }
    OpCode::from_u16(u16_from_buffer(&buf[..2]))
}

/// Returns the block number (or error code) stored at bytes 2..4 of a raw packet.
pub fn decode_block_number(buf: &[u8]) -> Option<u16> {
    if buf.len() < HEADER_SIZE {
        return None;
    }
    Some(u16_from_buffer(&buf[2..4]))
}

/// Parses an initial request. Only read and write requests are accepted.
///
/// The filename runs up to the first 0 byte, or to the end of the buffer if there is none. A
/// missing mode defaults to octet.
pub fn decode_request(buf: &[u8]) -> TftpResult<Request> {
    if buf.len() < 2 {
        return Err(SocketError::PacketParse("Packet too short!".to_string()));
    }

    let kind = match decode_opcode(buf) {
        Some(OpCode::Rrq) => RequestKind::Read,
        Some(OpCode::Wrq) => RequestKind::Write,
        _ => {
            return Err(SocketError::PacketParse(format!(
                "Expected a read or write request, got opcode {}",
                u16_from_buffer(&buf[..2])
            )))
        }
    };

    let (path, path_end) = string_from_buffer(&buf[2..]);
    if path.is_empty() {
        return Err(SocketError::PacketParse("Request does not name a file".to_string()));
    }

    let rest = buf.get(2 + path_end + 1..).unwrap_or(&[]);
    let (mode, _) = string_from_buffer(rest);
    let mode = if mode.is_empty() { "octet".to_string() } else { mode.to_lowercase() };

    Ok(Request { kind, path, mode })
}

fn encode_header(op: OpCode, value: u16, capacity: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + capacity);
    bytes.extend_from_slice(&op.as_u16().to_be_bytes());
    bytes.extend_from_slice(&value.to_be_bytes());
    bytes
}

pub fn encode_data(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = encode_header(OpCode::Data, block, payload.len());
    bytes.extend_from_slice(payload);
    bytes
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    encode_header(OpCode::Ack, block, 0)
}

pub fn encode_error(code: ErrorCode) -> Vec<u8> {
    encode_error_message(code, code.message())
}

fn encode_error_message(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut bytes = encode_header(OpCode::Error, code.code(), message.len());
    bytes.extend_from_slice(message.as_bytes());
    bytes
}

fn encode_request(op: OpCode, path: &str, mode: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(2 + path.len() + mode.len() + 2);
    bytes.extend_from_slice(&op.as_u16().to_be_bytes());
    bytes.extend_from_slice(path.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(mode.as_bytes());
    bytes.push(0);
    bytes
}

impl Packet {
    /// The error packet the server sends for `code`.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.message().to_string() }
    }

    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        match decode_opcode(buf) {
            Some(OpCode::Rrq) | Some(OpCode::Wrq) => {
                let request = decode_request(buf)?;
                let Request { kind, path, mode } = request;
                return Ok(match kind {
                    RequestKind::Read => Packet::ReadReq { path, mode },
                    RequestKind::Write => Packet::WriteReq { path, mode },
                });
            }
            Some(_) => {}
            None => return Err(SocketError::PacketParse("Unknown or missing opcode".to_string())),
        }

        let Some(value) = decode_block_number(buf) else {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        };

        match decode_opcode(buf) {
            Some(OpCode::Data) => {
                if buf.len() > MAX_PACKET_SIZE {
                    return Err(SocketError::PacketParse(format!(
                        "Data packet carries {} bytes, more than a block",
                        buf.len() - HEADER_SIZE
                    )));
                }
                Ok(Packet::Data { block: value, data: buf[HEADER_SIZE..].to_vec() })
            }
            Some(OpCode::Ack) => Ok(Packet::Ack { block: value }),
            _ => {
                let (message, _) = string_from_buffer(&buf[HEADER_SIZE..]);
                Ok(Packet::Error { code: ErrorCode::from_code(value), message })
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, mode),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => encode_ack(*block),
            Packet::Error { code, message } => encode_error_message(*code, message),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket connected to a single peer. Datagrams from any other address are
/// filtered out by the operating system.
#[derive(Debug)]
pub struct TftpSocket {
    sock: UdpSocket,
    peer: SocketAddr,
}

impl TftpSocket {
    /// Connects an already bound socket to `peer`.
    pub async fn connect(sock: UdpSocket, peer: SocketAddr) -> TftpResult<TftpSocket> {
        sock.connect(peer).await?;
        Ok(TftpSocket { sock, peer })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.local_addr()?)
    }

    pub async fn send(&self, packet: &Packet) -> TftpResult<()> {
        self.send_bytes(&packet.to_bytes()).await
    }

    pub async fn send_bytes(&self, bytes: &[u8]) -> TftpResult<()> {
        self.sock.send(bytes).await?;
        Ok(())
    }

    /// Waits up to `ttl` for the next datagram and returns its raw contents.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<Vec<u8>> {
        // One spare byte, so that an oversized datagram is seen as such instead of truncated.
        let mut buf = [0; MAX_PACKET_SIZE + 1];
        let total_written = timeout(ttl, self.sock.recv(&mut buf)).await??;
        Ok(buf[..total_written].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_packet_read_req() {
        let buf = vec![
            // opcode
            0x00, 0x01,
            // path: /path/to/data.txt with terminating nullchar
            0x2F, 0x70, 0x61, 0x74, 0x68, 0x2F, 0x74, 0x6F, 0x2F,
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: octet
            0x6F, 0x63, 0x74, 0x65, 0x74, 0x00];

        let request = assert_ok!(decode_request(&buf));
        assert_eq!(
            request,
            Request {
                kind: RequestKind::Read,
                path: "/path/to/data.txt".to_string(),
                mode: "octet".to_string()
            }
        );
    }

    #[test]
    fn test_packet_write_req() {
        let buf = vec![
            // opcode
            0x00, 0x02,
            // path: data.txt
            0x64, 0x61, 0x74, 0x61, 0x2E, 0x74, 0x78, 0x74, 0x00,
            // mode: NetAscii
            0x4E, 0x65, 0x74, 0x41, 0x73, 0x63, 0x69, 0x69, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(
            packet,
            Packet::WriteReq { path: "data.txt".to_string(), mode: "netascii".to_string() }
        );
    }

    #[test]
    fn test_request_without_terminator_or_mode() {
        let request = assert_ok!(decode_request(&[0x00, 0x01, 0x68, 0x69]));
        assert_eq!(request.path, "hi");
        assert_eq!(request.mode, "octet");
    }

    #[test]
    fn test_request_with_utf8_filename() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice("café.bin".as_bytes());
        buf.extend_from_slice(b"\0octet\0");

        let request = assert_ok!(decode_request(&buf));
        assert_eq!(request.path, "café.bin");

        // Bytes that are not UTF-8 do not stop the request from being decoded.
        let request = assert_ok!(decode_request(&[0x00, 0x01, 0x61, 0xFF, 0x00]));
        assert_eq!(request.path, "a\u{FFFD}");
    }

    #[tokio::test]
    async fn test_socket_keeps_oversized_datagram_whole() {
        let a = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
        let b = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
        let a_addr = assert_ok!(a.local_addr());
        let b_addr = assert_ok!(b.local_addr());
        let a = assert_ok!(TftpSocket::connect(a, b_addr).await);
        let b = assert_ok!(TftpSocket::connect(b, a_addr).await);

        assert_ok!(a.send_bytes(&encode_data(1, &[0x41; 600])).await);
        let raw = assert_ok!(b.recv_with_timeout(Duration::from_secs(1)).await);
        assert!(raw.len() > MAX_PACKET_SIZE);
        assert_err!(Packet::parse_from_buf(&raw));
    }

    #[test]
    fn test_request_decode_failures() {
        // Too short to carry an opcode
        assert_err!(decode_request(&[0x00]));
        // Data, ack, error and unknown opcodes are not requests
        assert_err!(decode_request(&[0x00, 0x03, 0x00, 0x01]));
        assert_err!(decode_request(&[0x00, 0x04, 0x00, 0x01]));
        assert_err!(decode_request(&[0x00, 0x05, 0x00, 0x01]));
        assert_err!(decode_request(&[0x00, 0x0A, 0x68, 0x69, 0x00]));
        assert_err!(decode_request(&[0x01, 0x01, 0x68, 0x69, 0x00]));
        // Empty filename
        assert_err!(decode_request(&[0x00, 0x01, 0x00, 0x6F, 0x00]));
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let packet = assert_ok!(Packet::parse_from_buf(&[0x00, 0x03, 0x00, 0x07]));
        assert_eq!(packet, Packet::Data { block: 7, data: vec![] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(packet, Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let buf = vec![
            // opcode
            0x00, 0x05,
            // Error code
            0x00, 0x04,
            // Error message: Illegal! (null terminated, as most clients send it)
            0x49, 0x6C, 0x6C, 0x65, 0x67, 0x61, 0x6C, 0x21, 0x00];

        let packet = assert_ok!(Packet::parse_from_buf(&buf));
        assert_eq!(
            packet,
            Packet::Error { code: ErrorCode::Illegal, message: "Illegal!".to_string() }
        );
    }

    #[test]
    fn test_packet_parse_failures() {
        assert_err!(Packet::parse_from_buf(&[0x10]));
        assert_err!(Packet::parse_from_buf(&[0x10, 0x00]));
        assert_err!(Packet::parse_from_buf(&[0x00, 0x09, 0x00, 0x00]));
        // Header cut short
        assert_err!(Packet::parse_from_buf(&[0x00, 0x04, 0x01]));
        // More than a block of data
        let mut oversized = encode_data(1, &[0x78; DATA_BUFFER_SIZE]);
        oversized.push(0x78);
        assert_err!(Packet::parse_from_buf(&oversized));
    }

    #[test]
    fn test_encode_data_and_ack() {
        assert_eq!(encode_data(0x0102, &[0xAA, 0xBB]), vec![0x00, 0x03, 0x01, 0x02, 0xAA, 0xBB]);
        assert_eq!(encode_data(9, &[]), vec![0x00, 0x03, 0x00, 0x09]);
        assert_eq!(encode_ack(0xFFFF), vec![0x00, 0x04, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_error_is_not_null_terminated() {
        let bytes = encode_error(ErrorCode::FileAlreadyExists);
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x06]);
        assert_eq!(&bytes[4..], b"File already exists");
        assert_eq!(Packet::error(ErrorCode::FileAlreadyExists).to_bytes(), bytes);
    }

    #[test]
    fn test_error_codes_match_the_wire() {
        let all = [
            ErrorCode::Undefined,
            ErrorCode::FileNotFound,
            ErrorCode::AccessViolation,
            ErrorCode::DiskFull,
            ErrorCode::Illegal,
            ErrorCode::UnknownTid,
            ErrorCode::FileAlreadyExists,
            ErrorCode::NoSuchUser,
            ErrorCode::PrematureTermination,
        ];
        for (expected, code) in all.iter().enumerate() {
            assert_eq!(code.code() as usize, expected);
            assert_eq!(ErrorCode::from_code(code.code()), *code);
            assert!(!code.message().is_empty());
        }
        assert_eq!(ErrorCode::from_code(42), ErrorCode::Undefined);
    }

    #[test]
    fn test_error_code_from_io_kind() {
        assert_eq!(ErrorCode::from(io::ErrorKind::NotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(io::ErrorKind::AlreadyExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(io::ErrorKind::PermissionDenied), ErrorCode::AccessViolation);
    }

    #[test]
    fn test_decode_block_number() {
        assert_eq!(decode_block_number(&[0x00, 0x04, 0x01, 0x00]), Some(256));
        assert_eq!(decode_block_number(&[0x00, 0x03, 0x00, 0x02, 0xFF]), Some(2));
        assert_eq!(decode_block_number(&[0x00, 0x04, 0x01]), None);
    }

    #[test]
    fn test_request_bytes_decode_back() {
        let request = Packet::ReadReq { path: "f50b.bin".to_string(), mode: "octet".to_string() };
        let bytes = request.to_bytes();
        assert_eq!(bytes.last(), Some(&0x00));
        let request = assert_ok!(decode_request(&bytes));
        assert_eq!(request.kind, RequestKind::Read);
        assert_eq!(request.path, "f50b.bin");
    }

    #[tokio::test]
    async fn test_socket_send_and_timeout() {
        let a = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
        let b = assert_ok!(UdpSocket::bind("127.0.0.1:0").await);
        let a_addr = assert_ok!(a.local_addr());
        let b_addr = assert_ok!(b.local_addr());
        let a = assert_ok!(TftpSocket::connect(a, b_addr).await);
        let b = assert_ok!(TftpSocket::connect(b, a_addr).await);
        assert_eq!(a.peer(), b_addr);

        assert_ok!(a.send(&Packet::Ack { block: 3 }).await);
        let raw = assert_ok!(b.recv_with_timeout(Duration::from_secs(1)).await);
        assert_eq!(raw, encode_ack(3));

        match b.recv_with_timeout(Duration::from_millis(20)).await {
            Err(SocketError::Timeout(_)) => {}
            other => panic!("expected a timeout, got {:?}", other),
        }
    }
}
