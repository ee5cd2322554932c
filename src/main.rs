// A TFTP server (RFC 1350, octet transfers only).
//
// Transfer begins with a request to read or write a file, sent to the server's well-known port.
// The server answers from a freshly bound port, so every transfer gets its own pair of transfer
// identifiers. Files move in blocks of 512 bytes; each data packet must be acknowledged before the
// next one is sent, and a block shorter than 512 bytes (possibly empty) ends the transfer.
//
// On loss, the side waiting for a response times out and retransmits its last packet. A response
// carrying the wrong block number is treated the same way. Both are retried a bounded number of
// times, after which the transfer is abandoned with an error packet.
//
// Error packets are sent as a courtesy, never acknowledged and never retransmitted.
//
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
// 8    Premature termination
//
// Server options:
// - Bind IP address
// - Timeout
// - Retry cap
// - Acceptable port range for transfer sockets

pub mod config;
pub mod listener;
pub mod retransmit;
pub mod session;
pub mod srv_conn;
pub mod tftp;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;

use config::{Cli, ServerConfig};
use listener::RequestListener;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli);
    log::info!(
        "Port {}, serving directory {}, timeout {} ms, {} retries",
        config.port,
        config.root_dir.display(),
        config.retry.timeout.as_millis(),
        config.retry.max_retries
    );

    let listener = RequestListener::bind(config).await?;
    listener.serve().await
}
