//! Server Module
//!
//! Construction-time wrapping of plain and TLS-terminating servers so
//! accepted connections pass through PROXY header negotiation before any
//! application handler sees them.

mod tls;
mod wrapper;

pub use tls::SecureStream;
pub use wrapper::{
    wrap, ConnHandler, ErrorHandler, ListenHandle, NetInterface, SecureHandler, Server,
    TlsInterface, Wrapped,
};
