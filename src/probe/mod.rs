//! Node reachability probing
//!
//! A probe is a plain TCP connect: resolve, dial, measure, close. It says
//! nothing about whether the proxy protocol behind the port works.

mod healthcheck;

pub use healthcheck::{BatchTicket, HealthChecker, NodeSource, ProbeReport, ProbeSink};

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Default per-probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of probes in flight at once
pub const DEFAULT_PROBE_CONCURRENCY: usize = 32;

/// Default period of the background check loop
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(300);

/// Why a probe failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("cannot resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of [`ProbeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeErrorKind {
    Timeout,
    ConnectionRefused,
    Dns,
    Other,
}

impl ProbeError {
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Timeout(_) => ProbeErrorKind::Timeout,
            ProbeError::ConnectionRefused(_) => ProbeErrorKind::ConnectionRefused,
            ProbeError::Dns { .. } => ProbeErrorKind::Dns,
            ProbeError::Other(_) => ProbeErrorKind::Other,
        }
    }
}

/// Opens a connection to an endpoint and tears it down again
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<(), ProbeError>;
}

/// Real TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<(), ProbeError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| ProbeError::Dns {
                host: host.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ProbeError::Dns {
                host: host.to_string(),
                reason: "no addresses".to_string(),
            });
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    drop(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Dial {} failed: {}", addr, e);
                    last_err = Some((addr, e));
                }
            }
        }

        Err(match last_err {
            Some((addr, e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                ProbeError::ConnectionRefused(addr.to_string())
            }
            Some((addr, e)) => ProbeError::Other(format!("{}: {}", addr, e)),
            None => ProbeError::Other("no address attempted".to_string()),
        })
    }
}

/// Probe `host:port` with the real TCP dialer.
///
/// Returns the elapsed time from dial start, in milliseconds.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<u32, ProbeError> {
    probe_with(&TcpDialer, host, port, timeout).await
}

/// Probe through an arbitrary dialer
pub async fn probe_with<D: Dialer + ?Sized>(
    dialer: &D,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<u32, ProbeError> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, dialer.dial(host, port)).await {
        Ok(Ok(())) => {
            let ms = u32::try_from(start.elapsed().as_millis()).unwrap_or(u32::MAX);
            debug!("Probe {}:{} ok in {}ms", host, port, ms);
            Ok(ms)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
