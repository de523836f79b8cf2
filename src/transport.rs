//! `protocol_init`: binds the slave and (optional) proxy listeners and
//! spawns their worker pools. The only module that owns a `TcpListener`
//! directly; everything downstream works with accepted streams.

use std::net::{IpAddr, TcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::log::LogSink;
use crate::state::CommandLog;
use crate::{proxy, worker};

/// `protocol_init`'s enumerated options (spec §6): a required slave port,
/// an optional proxy port, and a positive slave-count upper bound that
/// sizes both the accept backlog and the worker pool.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: IpAddr,
    pub slave_port: u16,
    pub proxy_port: Option<u16>,
    pub max_slaves: usize,
}

/// The running pool: join handles for every spawned worker thread, kept
/// only so a caller can detect a panicked thread or block on shutdown.
/// Workers never return on their own (`worker::run` / `proxy::run` loop
/// forever), so under ordinary operation these handles are simply held.
pub struct Pool {
    pub slave_workers: Vec<std::thread::JoinHandle<()>>,
    pub proxy_workers: Vec<std::thread::JoinHandle<()>>,
}

/// Binds the configured listeners and spawns `max_slaves` slave-accepting
/// worker threads, plus (if `proxy_port` is set) an equal number of
/// proxy-accepting worker threads. Mirrors the original's
/// `protocol_init()`: after this returns, the pool is live and
/// `log_state`/`log` are the shared handles the driver continues to use.
pub fn protocol_init(config: Config, log_state: Arc<CommandLog>, log: Arc<LogSink>) -> Result<Pool> {
    assert!(config.max_slaves > 0, "max_slaves must be a positive integer");

    let slave_listener = TcpListener::bind((config.listen, config.slave_port))
        .with_context(|| format!("binding slave listener on port {}", config.slave_port))?;
    tracing::info!(
        addr = %slave_listener.local_addr().context("reading slave listener address")?,
        max_slaves = config.max_slaves,
        "listening for slaves"
    );

    let slave_workers = worker::spawn_pool(slave_listener, Arc::clone(&log_state), Arc::clone(&log), config.max_slaves);

    let proxy_workers = match config.proxy_port {
        Some(port) => {
            let proxy_listener =
                TcpListener::bind((config.listen, port)).with_context(|| format!("binding proxy listener on port {port}"))?;
            tracing::info!(
                addr = %proxy_listener.local_addr().context("reading proxy listener address")?,
                "listening for log-proxy connections"
            );
            proxy::spawn_pool(proxy_listener, Arc::clone(&log), config.max_slaves)
        }
        None => Vec::new(),
    };

    Ok(Pool {
        slave_workers,
        proxy_workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::MarkerWords;

    #[test]
    fn binds_slave_listener_and_rejects_zero_max_slaves() {
        let log_state = Arc::new(CommandLog::new(MarkerWords::default(), crate::id::Xorshift32::new()));
        let log = Arc::new(LogSink::new(std::io::sink(), 0));
        let config = Config {
            listen: "127.0.0.1".parse().unwrap(),
            slave_port: 0,
            proxy_port: None,
            max_slaves: 1,
        };
        let pool = protocol_init(config, log_state, log).unwrap();
        assert_eq!(pool.slave_workers.len(), 1);
        assert!(pool.proxy_workers.is_empty());
    }

    #[test]
    #[should_panic(expected = "positive integer")]
    fn rejects_zero_max_slaves() {
        let log_state = Arc::new(CommandLog::default());
        let log = Arc::new(LogSink::new(std::io::sink(), 0));
        let config = Config {
            listen: "127.0.0.1".parse().unwrap(),
            slave_port: 0,
            proxy_port: None,
            max_slaves: 0,
        };
        let _ = protocol_init(config, log_state, log);
    }
}
