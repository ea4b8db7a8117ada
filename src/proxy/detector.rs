//! PROXY Header Detection
//!
//! Incremental classification of an accumulating byte buffer: decides
//! whether a complete PROXY v1 (text) or v2 (binary) header is present,
//! decodes it through the `ppp` crate, and reports how many leading bytes
//! to strip. Pure functions of the buffer, no I/O.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// PROXY v1 signature: the first five ASCII bytes of a text header.
const V1_SIGNATURE: &[u8] = b"PROXY";

/// Maximum PROXY v1 header length observed before the CRLF terminator.
pub const MAX_V1_HEADER: usize = 107;

/// Fixed 16-byte prefix of a PROXY v2 header (12-byte signature + version,
/// family and address-block length).
const V2_PREFIX: usize = 16;

/// Maximum total v2 header size (prefix + address block + TLVs).
pub const MAX_V2_HEADER: usize = 536;

/// PROXY protocol version a header was carried in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

/// Address family declared by a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

/// Decoded endpoint identity for one connection.
///
/// `client` is the original client as declared by the proxy; `proxy` is the
/// proxy's own address, the near end of the proxy-to-backend hop. Produced
/// once per connection and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    pub client: SocketAddr,
    pub proxy: SocketAddr,
    pub version: ProxyVersion,
}

impl EndpointInfo {
    pub fn family(&self) -> AddressFamily {
        match self.client.ip() {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }
}

/// Outcome of classifying the buffer accumulated so far.
#[derive(Debug)]
pub enum Detection {
    /// Not enough bytes to decide; keep reading.
    Incomplete,
    /// The first bytes cannot begin either signature.
    NotProxy,
    /// A signature-matching header of `consumed` bytes is present.
    ///
    /// `info` is `None` when the bytes were consumable but decoding
    /// produced no usable endpoint record (malformed under strict mode).
    Complete {
        info: Option<EndpointInfo>,
        consumed: usize,
    },
    /// A candidate header exceeded the length ceiling before completing.
    TooLong,
}

/// Error from the decode/encode collaborators.
#[derive(Debug)]
pub struct DecodeError(String);

impl DecodeError {
    fn new(msg: impl Into<String>) -> Self {
        DecodeError(msg.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PROXY decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

/// Classify the buffer accumulated so far.
///
/// Called after every read while a connection is armed; the same buffer is
/// re-examined as it grows, so every branch must be a pure function of the
/// bytes seen so far.
pub fn detect_header(buf: &[u8]) -> Detection {
    let v2_signature = ppp::v2::PROTOCOL_PREFIX;

    if buf.len() >= V1_SIGNATURE.len() && &buf[..V1_SIGNATURE.len()] == V1_SIGNATURE {
        // v1 candidate: incomplete until the CRLF terminator shows up.
        return match buf.windows(2).position(|w| w == b"\r\n") {
            Some(end) => {
                let consumed = end + 2;
                Detection::Complete {
                    info: decode_v1(&buf[..consumed]).ok(),
                    consumed,
                }
            }
            None if buf.len() > MAX_V1_HEADER => Detection::TooLong,
            None => Detection::Incomplete,
        };
    }

    if buf.len() >= v2_signature.len() && &buf[..v2_signature.len()] == v2_signature {
        // v2 candidate: the address-block length sits in bytes 14-15.
        if buf.len() < V2_PREFIX {
            return Detection::Incomplete;
        }
        let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
        let total = V2_PREFIX + addr_len;
        if total > MAX_V2_HEADER {
            return Detection::TooLong;
        }
        if buf.len() < total {
            return Detection::Incomplete;
        }
        return Detection::Complete {
            info: decode_v2(&buf[..total]).ok(),
            consumed: total,
        };
    }

    // Neither full signature matched. Only report not-a-header once the
    // buffer can no longer be a prefix of either one.
    let v1_head = &V1_SIGNATURE[..buf.len().min(V1_SIGNATURE.len())];
    let v2_head = &v2_signature[..buf.len().min(v2_signature.len())];
    if buf.starts_with(v1_head) || buf.starts_with(v2_head) {
        Detection::Incomplete
    } else {
        Detection::NotProxy
    }
}

/// Decode a complete PROXY v1 line (including the CRLF terminator).
pub fn decode_v1(header: &[u8]) -> Result<EndpointInfo, DecodeError> {
    let parsed = ppp::v1::Header::try_from(header)
        .map_err(|e| DecodeError::new(format!("v1 parse error: {:?}", e)))?;

    let (client, proxy) = match parsed.addresses {
        ppp::v1::Addresses::Tcp4(addrs) => (
            SocketAddr::new(IpAddr::V4(addrs.source_address), addrs.source_port),
            SocketAddr::new(IpAddr::V4(addrs.destination_address), addrs.destination_port),
        ),
        ppp::v1::Addresses::Tcp6(addrs) => (
            SocketAddr::new(IpAddr::V6(addrs.source_address), addrs.source_port),
            SocketAddr::new(IpAddr::V6(addrs.destination_address), addrs.destination_port),
        ),
        ppp::v1::Addresses::Unknown => {
            return Err(DecodeError::new("v1 UNKNOWN carries no usable endpoints"));
        }
    };

    Ok(EndpointInfo {
        client,
        proxy,
        version: ProxyVersion::V1,
    })
}

/// Decode a complete PROXY v2 header (exactly `16 + length` bytes).
pub fn decode_v2(header: &[u8]) -> Result<EndpointInfo, DecodeError> {
    let parsed = ppp::v2::Header::try_from(header)
        .map_err(|e| DecodeError::new(format!("v2 parse error: {:?}", e)))?;

    let (client, proxy) = match &parsed.addresses {
        ppp::v2::Addresses::IPv4(addrs) => (
            SocketAddr::new(IpAddr::V4(addrs.source_address), addrs.source_port),
            SocketAddr::new(IpAddr::V4(addrs.destination_address), addrs.destination_port),
        ),
        ppp::v2::Addresses::IPv6(addrs) => (
            SocketAddr::new(IpAddr::V6(addrs.source_address), addrs.source_port),
            SocketAddr::new(IpAddr::V6(addrs.destination_address), addrs.destination_port),
        ),
        ppp::v2::Addresses::Unix(_) | ppp::v2::Addresses::Unspecified => {
            return Err(DecodeError::new("v2 header carries no usable endpoints"));
        }
    };

    Ok(EndpointInfo {
        client,
        proxy,
        version: ProxyVersion::V2,
    })
}

/// Encode an endpoint record as a PROXY v1 text header.
///
/// Used by test and verification tooling, never by the interceptor.
pub fn encode_v1(info: &EndpointInfo) -> Result<Vec<u8>, DecodeError> {
    let header = match (info.client, info.proxy) {
        (SocketAddr::V4(src), SocketAddr::V4(dst)) => {
            format!("PROXY TCP4 {} {} {} {}\r\n", src.ip(), dst.ip(), src.port(), dst.port())
        }
        (SocketAddr::V6(src), SocketAddr::V6(dst)) => {
            format!("PROXY TCP6 {} {} {} {}\r\n", src.ip(), dst.ip(), src.port(), dst.port())
        }
        _ => {
            return Err(DecodeError::new("mixed address families in v1 header"));
        }
    };
    Ok(header.into_bytes())
}

/// Encode an endpoint record as a PROXY v2 binary header.
pub fn encode_v2(info: &EndpointInfo) -> Result<Vec<u8>, DecodeError> {
    ppp::v2::Builder::with_addresses(
        ppp::v2::Version::Two | ppp::v2::Command::Proxy,
        ppp::v2::Protocol::Stream,
        (info.client, info.proxy),
    )
    .build()
    .map_err(|e| DecodeError::new(format!("v2 build error: {}", e)))
}
