//! PROXY Protocol Module
//!
//! Handles HAProxy PROXY protocol v1/v2 header negotiation for accepted
//! connections. Supports auto-detection of protocol version, extraction
//! of the originating client identity, and transparent replay of payload
//! bytes read past the header.

mod detector;
mod interceptor;

pub use detector::{
    decode_v1, decode_v2, detect_header, encode_v1, encode_v2, AddressFamily, DecodeError, Detection, EndpointInfo,
    ProxyVersion, MAX_V1_HEADER, MAX_V2_HEADER,
};
pub use interceptor::{ConnectionInterceptor, InterceptError, ProxiedStream};
