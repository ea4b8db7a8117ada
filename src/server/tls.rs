//! Secure Endpoint Property Proxy
//!
//! A TLS session decrypts an inner [`ProxiedStream`] but has no knowledge
//! of the PROXY header that was stripped before the handshake. This
//! wrapper re-exposes the endpoint identity on the session object by
//! forwarding every accessor to the underlying plain connection at access
//! time rather than copying values when the session is built.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::server::TlsStream;

use crate::proxy::{EndpointInfo, ProxiedStream};

/// An established TLS session over a negotiated connection.
#[derive(Debug)]
pub struct SecureStream<S> {
    inner: TlsStream<ProxiedStream<S>>,
}

impl<S> SecureStream<S> {
    pub fn new(inner: TlsStream<ProxiedStream<S>>) -> Self {
        Self { inner }
    }

    fn plain(&self) -> &ProxiedStream<S> {
        self.inner.get_ref().0
    }

    /// Decoded endpoint identity from the underlying plain connection.
    pub fn endpoint(&self) -> Option<&EndpointInfo> {
        self.plain().endpoint()
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.plain().client_addr()
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.plain().proxy_addr()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.plain().remote_addr()
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.plain().remote_port()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.plain().local_addr()
    }

    pub fn get_ref(&self) -> &TlsStream<ProxiedStream<S>> {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut TlsStream<ProxiedStream<S>> {
        &mut self.inner
    }

    pub fn into_inner(self) -> TlsStream<ProxiedStream<S>> {
        self.inner
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
