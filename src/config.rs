use crate::retransmit::{RetryPolicy, DEFAULT_MAX_RETRIES};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port used when the one given on the command line is not a valid UDP port.
pub const DEFAULT_PORT: u16 = 4900;

/// The only directory name the server agrees to serve.
pub const DEFAULT_ROOT: &str = "tftpserverdir";

#[derive(Parser, Debug)]
#[command(name = "tftpd")]
#[command(about = "A lock-step TFTP server", long_about = None)]
pub struct Cli {
    /// UDP port to listen on
    pub port: String,

    /// Directory to serve
    pub directory: PathBuf,

    /// Listen ip
    #[arg(short, long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Timeout (ms)
    #[arg(short, long, default_value_t = 5000, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,

    /// Max retries
    #[arg(short, long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: u8,

    /// Ports used for transfer sockets, e.g. 50000-50100 (default: chosen by the OS)
    #[arg(long, value_parser = parse_port_range)]
    pub port_range: Option<RangeInclusive<u16>>,
}

fn parse_port_range(s: &str) -> Result<RangeInclusive<u16>, String> {
    let (lo, hi) = s.split_once('-').ok_or(format!("expected LO-HI, got '{s}'"))?;
    let lo: u16 = lo.trim().parse().map_err(|e| format!("bad port '{lo}': {e}"))?;
    let hi: u16 = hi.trim().parse().map_err(|e| format!("bad port '{hi}': {e}"))?;
    if lo == 0 || lo > hi {
        return Err(format!("'{s}' is not a usable port range"));
    }
    Ok(lo..=hi)
}

/// Everything a running server needs to know. Shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub port: u16,
    pub root_dir: PathBuf,
    pub retry: RetryPolicy,
    pub ephemeral_ports: Option<RangeInclusive<u16>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            root_dir: PathBuf::from(DEFAULT_ROOT),
            retry: RetryPolicy::default(),
            ephemeral_ports: None,
        }
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Accepts the directory name alone, optionally with one separator or other non-word character
/// on either side (`tftpserverdir`, `/tftpserverdir`, `tftpserverdir/`). Case is ignored.
fn is_expected_root(dir: &Path) -> bool {
    let Some(mut name) = dir.to_str() else {
        return false;
    };
    if let Some(c) = name.chars().next().filter(|&c| !is_word_char(c)) {
        name = &name[c.len_utf8()..];
    }
    if let Some(c) = name.chars().last().filter(|&c| !is_word_char(c)) {
        name = &name[..name.len() - c.len_utf8()];
    }
    name.eq_ignore_ascii_case(DEFAULT_ROOT)
}

impl ServerConfig {
    /// Builds the configuration from the command line. An unusable port or directory is replaced
    /// by its default rather than refusing to start.
    pub fn from_cli(cli: &Cli) -> ServerConfig {
        let port = match cli.port.trim().parse::<u16>() {
            Ok(port) => port,
            Err(e) => {
                log::warn!("Invalid port '{}' ({}), defaulting to {}", cli.port, e, DEFAULT_PORT);
                DEFAULT_PORT
            }
        };

        let root_dir = if is_expected_root(&cli.directory) {
            cli.directory.clone()
        } else {
            log::warn!(
                "The root directory must be the {} directory, not {}; using the default",
                DEFAULT_ROOT,
                cli.directory.display()
            );
            PathBuf::from(DEFAULT_ROOT)
        };

        ServerConfig {
            bind_ip: cli.bind,
            port,
            root_dir,
            retry: RetryPolicy {
                timeout: Duration::from_millis(cli.timeout),
                max_retries: cli.retries,
            },
            ephemeral_ports: cli.port_range.clone(),
        }
    }
}
