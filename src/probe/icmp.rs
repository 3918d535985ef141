//! ICMP echo over raw or datagram sockets.
//!
//! Runs on blocking sockets inside `spawn_blocking` for sub-millisecond timing
//! precision.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};

use super::{EchoReply, ProbeError};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMP_HEADER_LEN: usize = 8;

/// Large enough for a maximal IPv4 header plus the largest payload we send.
const RECV_BUFFER_LEN: usize = 2048;

/// Identifier shared by every request this process sends.
static ECHO_IDENTIFIER: OnceLock<u16> = OnceLock::new();

/// Per-call sequence counter.
static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Allocate the `(identifier, sequence)` pair for one echo request.
fn next_echo_id() -> (u16, u16) {
    let identifier = *ECHO_IDENTIFIER.get_or_init(rand::random::<u16>);
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SocketKind {
    /// Privileged; we see every ICMP packet and must filter on identifier.
    Raw,
    /// Unprivileged; the kernel rewrites the identifier and demultiplexes
    /// replies for us, so only the sequence can be checked.
    Dgram,
}

/// Header fields of a received ICMP packet.
#[derive(Debug, Clone, Copy, PartialEq)]
struct EchoHeader {
    kind: u8,
    identifier: u16,
    sequence: u16,
    ttl: Option<u8>,
}

/// Send one echo request to `ip` and wait for the matching reply.
pub(super) fn echo(ip: IpAddr, payload_bytes: usize, timeout: Duration) -> Result<EchoReply, ProbeError> {
    let is_v6 = ip.is_ipv6();
    let (socket, kind) = open_socket(is_v6)?;

    socket
        .set_write_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

    let dest = SocketAddr::new(ip, 0);
    socket.connect(&dest.into()).map_err(|e| classify_io(e, "connect"))?;

    let (identifier, sequence) = next_echo_id();
    let packet = build_echo_request(is_v6, identifier, sequence, payload_bytes);

    // Start timing just before send
    let start = Instant::now();
    let deadline = start + timeout;

    socket.send(&packet).map_err(|e| classify_io(e, "send"))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); RECV_BUFFER_LEN];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ProbeError::Timeout(timeout));
        }
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| ProbeError::Network(format!("Failed to set timeout: {}", e)))?;

        let (len, from) = socket.recv_from(&mut buf).map_err(|e| {
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                classify_io(e, "receive")
            }
        })?;
        // SAFETY: recv_from initialized the first `len` bytes
        let data: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        // Stop timing immediately after receive
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        let Some(header) = parse_echo_header(data, is_v6) else {
            continue;
        };
        if !is_matching_reply(&header, is_v6, kind, identifier, sequence) {
            // Someone else's traffic; keep waiting for ours.
            continue;
        }

        let reply_addr = from.as_socket().map(|sa| sa.ip()).unwrap_or(ip);
        return Ok(EchoReply {
            latency_ms: elapsed.as_secs_f64() * 1000.0,
            reply_addr,
            ttl: header.ttl,
        });
    }
}

/// Open an ICMP socket, RAW first (privileged) then DGRAM (unprivileged).
fn open_socket(is_v6: bool) -> Result<(Socket, SocketKind), ProbeError> {
    let (domain, protocol) = if is_v6 {
        (Domain::IPV6, Protocol::ICMPV6)
    } else {
        (Domain::IPV4, Protocol::ICMPV4)
    };

    if let Ok(socket) = Socket::new(domain, Type::RAW, Some(protocol)) {
        return Ok((socket, SocketKind::Raw));
    }
    Socket::new(domain, Type::DGRAM, Some(protocol))
        .map(|socket| (socket, SocketKind::Dgram))
        .map_err(|e| classify_io(e, "create ICMP socket"))
}

fn classify_io(e: io::Error, op: &str) -> ProbeError {
    if e.kind() == io::ErrorKind::PermissionDenied || e.raw_os_error() == Some(1) {
        // EPERM surfaces as "Operation not permitted" rather than PermissionDenied
        ProbeError::PermissionDenied(format!("Failed to {}: {}", op, e))
    } else {
        ProbeError::Network(format!("Failed to {}: {}", op, e))
    }
}

/// Build an echo request: 8-byte header followed by `payload_bytes` of payload.
///
/// The payload starts with the send timestamp and is padded with a counting
/// pattern. The kernel fills in the ICMPv6 checksum, so it is left zero there.
fn build_echo_request(is_v6: bool, identifier: u16, sequence: u16, payload_bytes: usize) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_LEN + payload_bytes];

    packet[0] = if is_v6 { ICMPV6_ECHO_REQUEST } else { ICMP_ECHO_REQUEST };
    packet[1] = 0; // Code: 0
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    let stamp = timestamp.to_be_bytes();
    for (i, byte) in packet[ICMP_HEADER_LEN..].iter_mut().enumerate() {
        *byte = stamp.get(i).copied().unwrap_or(i as u8);
    }

    if !is_v6 {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    packet
}

/// Parse the ICMP header out of a received datagram.
///
/// IPv4 raw sockets (and datagram sockets on some platforms) deliver the IP
/// header first; its TTL is reported when present.
fn parse_echo_header(data: &[u8], is_v6: bool) -> Option<EchoHeader> {
    let (offset, ttl) = if !is_v6 && data.first().map(|b| b >> 4) == Some(4) {
        let ihl = usize::from(data[0] & 0x0f) * 4;
        (ihl, data.get(8).copied())
    } else {
        (0, None)
    };

    let icmp = data.get(offset..offset + ICMP_HEADER_LEN)?;
    Some(EchoHeader {
        kind: icmp[0],
        identifier: u16::from_be_bytes([icmp[4], icmp[5]]),
        sequence: u16::from_be_bytes([icmp[6], icmp[7]]),
        ttl,
    })
}

fn is_matching_reply(
    header: &EchoHeader,
    is_v6: bool,
    kind: SocketKind,
    identifier: u16,
    sequence: u16,
) -> bool {
    let reply_type = if is_v6 { ICMPV6_ECHO_REPLY } else { ICMP_ECHO_REPLY };
    header.kind == reply_type
        && header.sequence == sequence
        && (kind == SocketKind::Dgram || header.identifier == identifier)
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }

    // Handle odd byte
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold 32-bit sum to 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
