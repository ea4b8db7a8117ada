//! Server Wrapping
//!
//! Decorates a transport's construction entry points so every accepted
//! connection is routed through a fresh [`ConnectionInterceptor`] before
//! it reaches the handlers the application registered. Handlers that were
//! registered for plain accepted connections are moved to fire only once
//! negotiation completes; for encrypted servers the established session is
//! handed over as a [`SecureStream`] so the endpoint identity survives the
//! handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::config::{OptionsPatch, ProxyOptions};
use crate::proxy::{ConnectionInterceptor, InterceptError, ProxiedStream};
use crate::server::tls::SecureStream;

/// Handler for a (negotiated or plain) connection. Returns the connection
/// to pass it down the chain, or `None` to consume it.
pub type ConnHandler = Arc<
    dyn Fn(ProxiedStream<TcpStream>) -> BoxFuture<'static, Option<ProxiedStream<TcpStream>>>
        + Send
        + Sync,
>;

/// Handler for an established TLS session.
pub type SecureHandler = Arc<
    dyn Fn(SecureStream<TcpStream>) -> BoxFuture<'static, Option<SecureStream<TcpStream>>>
        + Send
        + Sync,
>;

/// Handler for negotiation failures.
pub type ErrorHandler = Arc<dyn Fn(&InterceptError) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    /// Plain accepted connections (fires pre-negotiation on unwrapped
    /// servers only; wrapping moves these to `proxied`).
    connection: RwLock<Vec<ConnHandler>>,
    /// Fully negotiated connections.
    proxied: RwLock<Vec<ConnHandler>>,
    /// Established TLS sessions.
    secure: RwLock<Vec<SecureHandler>>,
    /// Per-connection negotiation errors.
    error: RwLock<Vec<ErrorHandler>>,
}

/// A listening server produced by one of the construction entry points.
///
/// Handler registration happens before [`Server::listen`]; the registries
/// are only read afterwards.
pub struct Server {
    handlers: Handlers,
    tls: Option<TlsAcceptor>,
    idle_timeout: Option<Duration>,
    proxy_options: Option<Arc<ProxyOptions>>,
}

impl Server {
    fn new(tls: Option<TlsAcceptor>) -> Self {
        Self {
            handlers: Handlers::default(),
            tls,
            idle_timeout: None,
            proxy_options: None,
        }
    }

    pub fn on_connection<F>(&self, handler: F)
    where
        F: Fn(ProxiedStream<TcpStream>) -> BoxFuture<'static, Option<ProxiedStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.connection.write().push(Arc::new(handler));
    }

    pub fn on_proxied_connection<F>(&self, handler: F)
    where
        F: Fn(ProxiedStream<TcpStream>) -> BoxFuture<'static, Option<ProxiedStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.proxied.write().push(Arc::new(handler));
    }

    pub fn on_secure_connection<F>(&self, handler: F)
    where
        F: Fn(SecureStream<TcpStream>) -> BoxFuture<'static, Option<SecureStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.secure.write().push(Arc::new(handler));
    }

    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&InterceptError) + Send + Sync + 'static,
    {
        self.handlers.error.write().push(Arc::new(handler));
    }

    /// Currently registered plain-connection handlers.
    pub fn connection_handlers(&self) -> Vec<ConnHandler> {
        self.handlers.connection.read().clone()
    }

    /// Remove and return every plain-connection handler.
    pub fn clear_connection_handlers(&self) -> Vec<ConnHandler> {
        std::mem::take(&mut *self.handlers.connection.write())
    }

    pub fn proxied_handlers(&self) -> Vec<ConnHandler> {
        self.handlers.proxied.read().clone()
    }

    fn secure_handlers(&self) -> Vec<SecureHandler> {
        self.handlers.secure.read().clone()
    }

    fn error_handlers(&self) -> Vec<ErrorHandler> {
        self.handlers.error.read().clone()
    }

    fn add_proxied_handler(&self, handler: ConnHandler) {
        self.handlers.proxied.write().push(handler);
    }

    /// Connection inactivity timeout; fires a graceful end of the raw
    /// connection, before or independent of negotiation completing.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.idle_timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Resolved wrapper options, present once the server was constructed
    /// through [`wrap`].
    pub fn proxy_options(&self) -> Option<&Arc<ProxyOptions>> {
        self.proxy_options.as_ref()
    }

    /// Bind and start accepting, one task per connection.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> io::Result<ListenHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let server = Arc::new(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(server.handle_connection(stream, peer, local_addr));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                    }
                }
            }
        });
        Ok(ListenHandle { local_addr, task })
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
    ) {
        match self.proxy_options.clone() {
            Some(options) => {
                let transport = options.transport.as_deref();
                if let Some(nodelay) = transport.and_then(|t| t.nodelay) {
                    let _ = stream.set_nodelay(nodelay);
                }
                let idle = self
                    .idle_timeout
                    .or_else(|| transport.and_then(|t| t.idle_timeout()));

                let interceptor = ConnectionInterceptor::new(stream, Arc::clone(&options))
                    .socket_addrs(peer, local)
                    .idle_timeout(idle);
                match interceptor.negotiate().await {
                    Ok(conn) => {
                        debug!(%peer, client = ?conn.client_addr(), "connection negotiated");
                        self.dispatch(conn, self.proxied_handlers()).await;
                    }
                    Err(err) => {
                        if err.strict_violation() && options.ignore_strict_exceptions {
                            debug!(%peer, error = %err, "dropping connection silently");
                        } else {
                            warn!(%peer, error = %err, "connection rejected");
                            for handler in self.error_handlers() {
                                handler(&err);
                            }
                        }
                    }
                }
            }
            None => {
                let conn = ProxiedStream::passthrough(stream, peer, local);
                self.dispatch(conn, self.connection_handlers()).await;
            }
        }
    }

    /// Hand the connection down the handler chain, exactly once each, in
    /// registration order; a handler returning `None` consumes it. For
    /// encrypted servers the survivor then goes through the handshake and
    /// the secure chain.
    async fn dispatch(&self, conn: ProxiedStream<TcpStream>, handlers: Vec<ConnHandler>) {
        let mut conn = Some(conn);
        for handler in handlers {
            match conn.take() {
                Some(current) => conn = handler(current).await,
                None => break,
            }
        }
        let Some(conn) = conn else { return };
        let Some(acceptor) = &self.tls else { return };

        match acceptor.accept(conn).await {
            Ok(session) => {
                let mut session = Some(SecureStream::new(session));
                for handler in self.secure_handlers() {
                    match session.take() {
                        Some(current) => session = handler(current).await,
                        None => break,
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "TLS handshake failed");
            }
        }
    }
}

/// Handle to a listening server; aborts the accept loop when dropped.
pub struct ListenHandle {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ListenHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for ListenHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Plain TCP construction interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetInterface;

impl NetInterface {
    pub fn new() -> Self {
        NetInterface
    }

    /// Construct a server whose handler fires on every accepted
    /// connection.
    pub fn create_server<F>(&self, handler: F) -> Server
    where
        F: Fn(ProxiedStream<TcpStream>) -> BoxFuture<'static, Option<ProxiedStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        let server = Server::new(None);
        server.on_connection(handler);
        server
    }
}

/// TLS-terminating construction interface.
#[derive(Clone)]
pub struct TlsInterface {
    config: Arc<ServerConfig>,
}

impl TlsInterface {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Construct a server whose handler fires on every established TLS
    /// session.
    pub fn create_secure_server<F>(&self, handler: F) -> Server
    where
        F: Fn(SecureStream<TcpStream>) -> BoxFuture<'static, Option<SecureStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        let server = Server::new(Some(TlsAcceptor::from(Arc::clone(&self.config))));
        server.on_secure_connection(handler);
        server
    }
}

/// Wrap a construction interface so that every connection its servers
/// accept is routed through PROXY header negotiation first.
///
/// `options` is merged over the documented defaults field by field; `None`
/// resolves to the defaults.
pub fn wrap<I>(iface: I, options: Option<OptionsPatch>) -> Wrapped<I> {
    Wrapped {
        iface,
        options: Arc::new(ProxyOptions::resolve(options)),
    }
}

/// A wrapped construction interface. Exposes the same entry points as the
/// interface it decorates, with identical arguments.
pub struct Wrapped<I> {
    iface: I,
    options: Arc<ProxyOptions>,
}

impl<I> Wrapped<I> {
    /// The options every server constructed through this wrapper shares.
    pub fn options(&self) -> &Arc<ProxyOptions> {
        &self.options
    }
}

impl Wrapped<NetInterface> {
    pub fn create_server<F>(&self, handler: F) -> Server
    where
        F: Fn(ProxiedStream<TcpStream>) -> BoxFuture<'static, Option<ProxiedStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        rewire(self.iface.create_server(handler), Arc::clone(&self.options))
    }
}

impl Wrapped<TlsInterface> {
    pub fn create_secure_server<F>(&self, handler: F) -> Server
    where
        F: Fn(SecureStream<TcpStream>) -> BoxFuture<'static, Option<SecureStream<TcpStream>>>
            + Send
            + Sync
            + 'static,
    {
        rewire(
            self.iface.create_secure_server(handler),
            Arc::clone(&self.options),
        )
    }
}

/// One-time rewiring, before the server accepts its first connection:
/// handlers registered for plain accepted connections fire only after
/// negotiation; secure handlers receive the property-proxying session
/// wrapper at dispatch time.
fn rewire(mut server: Server, options: Arc<ProxyOptions>) -> Server {
    for handler in server.clear_connection_handlers() {
        server.add_proxied_handler(handler);
    }
    server.proxy_options = Some(options);
    server
}
