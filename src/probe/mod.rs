//! Probe module for network monitoring.
//!
//! ICMP echo is the only supported probe. The [`Transport`] trait is the seam
//! the scheduler drives, so rounds can run against a fake in tests.

mod icmp;

use std::net::IpAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::db::PingStatus;

pub const MIN_PAYLOAD_BYTES: usize = 8;
pub const MAX_PAYLOAD_BYTES: usize = 1400;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("probe cancelled")]
    Cancelled,
}

impl ProbeError {
    /// Classification recorded for a failed probe.
    pub fn status(&self) -> PingStatus {
        match self {
            ProbeError::Timeout(_) => PingStatus::Timeout,
            ProbeError::PermissionDenied(_) => PingStatus::PermissionDenied,
            _ => PingStatus::ProbeError,
        }
    }
}

/// One echo request.
#[derive(Debug, Clone)]
pub struct EchoRequest {
    pub address: String,
    pub payload_bytes: usize,
    pub timeout: Duration,
    /// Caller deadline; the probe waits until whichever comes first. Round
    /// workers leave it unset so a long sweep never shortens a probe.
    pub deadline: Option<Instant>,
}

impl EchoRequest {
    pub fn new(address: &str, payload_bytes: usize, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            payload_bytes,
            timeout,
            deadline: None,
        }
    }

    /// Time left to wait for a reply, `None` once the deadline has passed.
    pub fn effective_timeout(&self, now: Instant) -> Option<Duration> {
        let timeout = match self.deadline {
            Some(deadline) => self.timeout.min(deadline.saturating_duration_since(now)),
            None => self.timeout,
        };
        (!timeout.is_zero()).then_some(timeout)
    }
}

/// A matching echo reply.
#[derive(Debug, Clone, PartialEq)]
pub struct EchoReply {
    pub latency_ms: f64,
    pub reply_addr: IpAddr,
    pub ttl: Option<u8>,
}

/// Sends one echo request and waits for the matching reply.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns [`ProbeError::Cancelled`] as soon as `cancel` fires; nothing
    /// about a cancelled probe should be recorded.
    async fn probe(&self, request: &EchoRequest, cancel: &CancellationToken) -> Result<EchoReply, ProbeError>;
}

/// Native ICMP transport over socket2.
#[derive(Debug, Default, Clone)]
pub struct IcmpTransport;

impl IcmpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for IcmpTransport {
    async fn probe(&self, request: &EchoRequest, cancel: &CancellationToken) -> Result<EchoReply, ProbeError> {
        if !(MIN_PAYLOAD_BYTES..=MAX_PAYLOAD_BYTES).contains(&request.payload_bytes) {
            return Err(ProbeError::Config(format!(
                "payload must be {}-{} bytes, got {}",
                MIN_PAYLOAD_BYTES, MAX_PAYLOAD_BYTES, request.payload_bytes
            )));
        }
        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }

        let started = Instant::now();
        let timeout = request
            .effective_timeout(started)
            .ok_or(ProbeError::Timeout(request.timeout))?;

        // Resolve before spawn_blocking (DNS is async); it spends the same budget
        let ip = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProbeError::Cancelled),
            resolved = tokio::time::timeout(timeout, resolve_address(&request.address)) => {
                resolved.map_err(|_| ProbeError::Timeout(timeout))??
            }
        };
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }

        let payload_bytes = request.payload_bytes;
        let task = tokio::task::spawn_blocking(move || icmp::echo(ip, payload_bytes, remaining));

        // The blocking read cannot be interrupted; on cancel we stop waiting for
        // it and the thread exits on its own read timeout.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            joined = task => joined
                .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?,
        }
    }
}

/// Resolve hostname to IP address.
async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    // Try direct parse first
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("No addresses found for {}", address)))
}
