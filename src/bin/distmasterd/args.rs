use std::net::{IpAddr, Ipv4Addr};

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub listen: IpAddr,
    /// TCP port slaves connect to.
    #[arg(short, long, default_value_t = 1234)]
    pub slave_port: u16,
    /// TCP port for the log-proxy listener. Omit to disable the proxy.
    #[arg(short, long)]
    pub proxy_port: Option<u16>,
    /// Maximum number of concurrent slave connections.
    #[arg(short, long, default_value_t = 8)]
    pub max_slaves: usize,
    /// Diagnostic verbosity (repeatable: -d, -dd, -ddd).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub debug_level: u8,
    /// Enables human-friendly (pretty) operational logging instead of JSON.
    #[arg(long, default_value_t)]
    pub debug: bool,
}
