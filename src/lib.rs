//! # proxywrap
//!
//! Transparent HAProxy PROXY protocol (v1 and v2) support for stream
//! servers. Wrapping a server construction interface with [`wrap`] makes
//! every server built through it consume the PROXY header that load
//! balancers such as HAProxy or an ELB in TCP mode prepend to each
//! connection, and re-expose the originating client's address and port on
//! the connection handed to application handlers. The header never
//! reaches application code; payload bytes that arrive in the same read
//! are replayed in order.
//!
//! ```no_run
//! use proxywrap::{wrap, NetInterface};
//!
//! # async fn run() -> std::io::Result<()> {
//! let net = wrap(NetInterface::new(), None);
//! let server = net.create_server(|conn| {
//!     Box::pin(async move {
//!         println!("client: {:?}", conn.remote_addr());
//!         Some(conn)
//!     })
//! });
//! let handle = server.listen("0.0.0.0:8080").await?;
//! println!("listening on {}", handle.local_addr());
//! # Ok(())
//! # }
//! ```
//!
//! In strict mode (the default) connections that do not begin with a
//! well-formed PROXY header are rejected before any handler runs. TLS
//! servers negotiate the plaintext header first and hand handlers a
//! [`SecureStream`] that still answers endpoint queries.

pub mod config;
pub mod proxy;
pub mod server;

pub use config::{OptionsPatch, ProxyOptions, TransportOptions};
pub use proxy::{
    ConnectionInterceptor, EndpointInfo, InterceptError, ProxiedStream, ProxyVersion,
};
pub use server::{wrap, ListenHandle, NetInterface, SecureStream, Server, TlsInterface, Wrapped};
