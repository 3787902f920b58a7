use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};

use clap::{Parser, ValueHint, builder::RangedU64ValueParser, value_parser};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// HTTP service address. A bare `:port` listens on every interface.
    #[arg(long, default_value = ":8080", value_parser = parse_listen_addr)]
    pub addr: SocketAddr,

    /// HTML file served at `/` instead of the bundled landing page.
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub home: Option<PathBuf>,

    /// Seconds a client may stay silent (no pong) before it is dropped.
    #[arg(long, default_value_t = 60, value_parser = value_parser!(u64).range(1..))]
    pub pong_wait_secs: u64,

    /// Seconds allowed for a single write to a client.
    #[arg(long, default_value_t = 10, value_parser = value_parser!(u64).range(1..))]
    pub write_wait_secs: u64,

    /// Largest inbound message in bytes.
    #[arg(long, default_value_t = 512, value_parser = positive_size())]
    pub max_message_size: usize,

    /// Outbound messages buffered per client before it is evicted.
    #[arg(long, default_value_t = 256, value_parser = positive_size())]
    pub queue_capacity: usize,
}

fn positive_size() -> RangedU64ValueParser<usize> {
    RangedU64ValueParser::new().range(1..)
}

/// Accepts `host:port` socket addresses and the `:port` shorthand.
pub fn parse_listen_addr(raw: &str) -> Result<SocketAddr, String> {
    if let Some(port) = raw.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|err| format!("invalid port '{port}': {err}"))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    raw.parse()
        .map_err(|err| format!("invalid listen address '{raw}': {err}"))
}
