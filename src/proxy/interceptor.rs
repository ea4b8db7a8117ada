//! Connection Interception
//!
//! Per-connection state machine that buffers incoming bytes until a PROXY
//! header is recognized, strips it, and hands the connection back as a
//! [`ProxiedStream`] carrying the decoded endpoint identity. Events observed
//! while interception is active (leftover data, end-of-stream) are replayed
//! through an explicit queue so the application sees the stream exactly as
//! if no header had ever been present.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::config::ProxyOptions;
use crate::proxy::detector::{detect_header, Detection, EndpointInfo, MAX_V1_HEADER};

/// Initial capacity of the accumulation buffer; enough for any v1 header
/// and the common v2 case.
const READ_BUFFER_CAPACITY: usize = MAX_V1_HEADER + 1;

/// Errors that terminate a single connection's negotiation.
///
/// All three are connection-fatal and non-retryable; none affect other
/// connections or the accept loop. Each carries the raw bytes observed so
/// far, as text, for diagnostics.
#[derive(Debug)]
pub enum InterceptError {
    /// First bytes do not match either signature (strict mode only).
    NonProxyConnection { header: String },
    /// Signature matched but decoding produced no usable endpoint record.
    MalformedHeader { header: String },
    /// A candidate header exceeded the length ceiling before completing.
    HeaderTooLong { header: String },
}

impl InterceptError {
    /// Raw header bytes observed before the connection was destroyed.
    pub fn header(&self) -> &str {
        match self {
            InterceptError::NonProxyConnection { header }
            | InterceptError::MalformedHeader { header }
            | InterceptError::HeaderTooLong { header } => header,
        }
    }

    /// Whether this error exists only because of strict-mode policy.
    ///
    /// Strict-policy violations are suppressed from the error channel when
    /// `ignore_strict_exceptions` is set; an oversized header is a protocol
    /// integrity problem and is always delivered.
    pub fn strict_violation(&self) -> bool {
        matches!(
            self,
            InterceptError::NonProxyConnection { .. } | InterceptError::MalformedHeader { .. }
        )
    }
}

impl fmt::Display for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::NonProxyConnection { .. } => write!(f, "non-PROXY protocol connection"),
            InterceptError::MalformedHeader { .. } => write!(f, "PROXY protocol malformed header"),
            InterceptError::HeaderTooLong { .. } => write!(f, "PROXY header too long"),
        }
    }
}

impl std::error::Error for InterceptError {}

#[derive(Debug)]
enum ErrorKind {
    NonProxy,
    Malformed,
    TooLong,
}

/// Stream events recorded while a connection is armed, replayed in order
/// once its normal dispatch is restored.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Bytes),
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Dispatch suspended, buffering toward a classification.
    Armed,
    /// Original dispatch restored; terminal.
    Resolved,
    /// Connection torn down; terminal.
    Destroyed,
}

/// Per-connection negotiation driver.
///
/// Owns the raw stream until the header question is settled, then either
/// yields a [`ProxiedStream`] (resolved) or an [`InterceptError`] after
/// shutting the stream down (destroyed). Consuming `self` makes the
/// resolve transition single-shot by construction; the destroy transition
/// is additionally guarded so a racing teardown stays a no-op.
pub struct ConnectionInterceptor<S> {
    stream: S,
    options: Arc<ProxyOptions>,
    buf: BytesMut,
    history: VecDeque<StreamEvent>,
    state: State,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
    idle_timeout: Option<Duration>,
}

impl<S> ConnectionInterceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, options: Arc<ProxyOptions>) -> Self {
        Self {
            stream,
            options,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            history: VecDeque::new(),
            state: State::Armed,
            peer: None,
            local: None,
            idle_timeout: None,
        }
    }

    /// Socket-level addresses, used for the generic remote accessors when
    /// no identity is decoded or `override_remote` is off.
    pub fn socket_addrs(mut self, peer: SocketAddr, local: SocketAddr) -> Self {
        self.peer = Some(peer);
        self.local = Some(local);
        self
    }

    /// Inactivity timeout applied to each read while armed. When it fires
    /// the raw connection is ended (not destroyed) and negotiation follows
    /// the end-of-stream rules.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Drive the state machine until a terminal transition.
    pub async fn negotiate(mut self) -> Result<ProxiedStream<S>, InterceptError> {
        loop {
            let read = match self.idle_timeout {
                Some(limit) => match timeout(limit, self.stream.read_buf(&mut self.buf)).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!(peer = ?self.peer, "idle timeout while negotiating, ending connection");
                        let _ = self.stream.shutdown().await;
                        return self.finish_eof().await;
                    }
                },
                None => self.stream.read_buf(&mut self.buf).await,
            };

            match read {
                Ok(0) => return self.finish_eof().await,
                Ok(_) => {}
                // A connection lost mid-buffer is not distinguished from a
                // clean end of stream.
                Err(_) => return self.finish_eof().await,
            }

            match detect_header(&self.buf) {
                Detection::Incomplete => continue,
                Detection::NotProxy => {
                    if self.options.strict {
                        return Err(self.destroy(ErrorKind::NonProxy).await);
                    }
                    // Pass the connection through untouched: the whole
                    // buffer becomes the first data the application reads.
                    return Ok(self.resolve(None, 0));
                }
                Detection::Complete { info, consumed } => {
                    if self.options.strict && info.is_none() {
                        return Err(self.destroy(ErrorKind::Malformed).await);
                    }
                    return Ok(self.resolve(info, consumed));
                }
                Detection::TooLong => {
                    return Err(self.destroy(ErrorKind::TooLong).await);
                }
            }
        }
    }

    /// End-of-stream (or network error) before any classification.
    async fn finish_eof(mut self) -> Result<ProxiedStream<S>, InterceptError> {
        self.history.push_back(StreamEvent::Eof);
        if !self.buf.is_empty() && self.options.strict {
            // A truncated header under strict mode is a rejection, not a
            // clean end of stream.
            return Err(self.destroy(ErrorKind::NonProxy).await);
        }
        Ok(self.resolve(None, 0))
    }

    /// Terminal success: restore dispatch, queue leftover bytes and any
    /// recorded events for replay.
    fn resolve(mut self, info: Option<EndpointInfo>, consumed: usize) -> ProxiedStream<S> {
        self.state = State::Resolved;
        let Self {
            stream,
            options,
            mut buf,
            history,
            peer,
            local,
            ..
        } = self;

        if consumed > 0 {
            buf.advance(consumed);
        }
        let mut conn = ProxiedStream {
            inner: stream,
            replay: history,
            info,
            override_remote: options.override_remote,
            peer,
            local,
        };
        if !buf.is_empty() {
            conn.unread(buf.freeze());
        }
        conn
    }

    /// Terminal failure: tear the raw connection down exactly once.
    async fn destroy(&mut self, kind: ErrorKind) -> InterceptError {
        if self.teardown() {
            let _ = self.stream.shutdown().await;
        }
        let header = String::from_utf8_lossy(&self.buf).into_owned();
        match kind {
            ErrorKind::NonProxy => InterceptError::NonProxyConnection { header },
            ErrorKind::Malformed => InterceptError::MalformedHeader { header },
            ErrorKind::TooLong => InterceptError::HeaderTooLong { header },
        }
    }

    /// Idempotent destroy transition. Returns whether this call performed
    /// it; repeated calls (a close racing a detected error) are no-ops.
    fn teardown(&mut self) -> bool {
        if self.state != State::Armed {
            return false;
        }
        self.state = State::Destroyed;
        true
    }
}

/// A connection whose PROXY preamble has been stripped.
///
/// Decorates the raw stream: reads drain the replay queue (pushed-back
/// bytes first, then any end-of-stream observed during interception)
/// before touching the inner stream; writes pass straight through. The
/// decoded identity, when present, is exposed through explicit accessors
/// populated at resolution time.
#[derive(Debug)]
pub struct ProxiedStream<S> {
    inner: S,
    replay: VecDeque<StreamEvent>,
    info: Option<EndpointInfo>,
    override_remote: bool,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

impl<S> ProxiedStream<S> {
    /// A connection handed out without interception (unwrapped servers).
    pub fn passthrough(stream: S, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            inner: stream,
            replay: VecDeque::new(),
            info: None,
            override_remote: false,
            peer: Some(peer),
            local: Some(local),
        }
    }

    /// Push unread bytes back onto the head of the readable stream.
    pub fn unread(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.replay.push_front(StreamEvent::Data(data));
        }
    }

    /// Decoded endpoint identity, if a valid header was negotiated.
    pub fn endpoint(&self) -> Option<&EndpointInfo> {
        self.info.as_ref()
    }

    /// Original client address declared by the proxy.
    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.info.map(|i| i.client)
    }

    /// The proxy's own address (near end of the proxy-to-backend hop).
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        self.info.map(|i| i.proxy)
    }

    /// Generic remote address accessor. Returns the decoded client when
    /// the wrapping server was configured with `override_remote`, the
    /// socket peer otherwise.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        if self.override_remote {
            self.client_addr().or(self.peer)
        } else {
            self.peer
        }
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.remote_addr().map(|a| a.port())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ProxiedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while let Some(event) = this.replay.front_mut() {
            match event {
                StreamEvent::Data(bytes) => {
                    if bytes.is_empty() {
                        this.replay.pop_front();
                        continue;
                    }
                    let n = bytes.len().min(buf.remaining());
                    if n == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    buf.put_slice(&bytes.split_to(n));
                    return Poll::Ready(Ok(()));
                }
                // A replayed end-of-stream is sticky: the inner stream is
                // never consulted again.
                StreamEvent::Eof => return Poll::Ready(Ok(())),
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ProxiedStream<S> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OptionsPatch, ProxyOptions};
    use crate::proxy::detector::{encode_v2, ProxyVersion};
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn options(strict: bool) -> Arc<ProxyOptions> {
        Arc::new(ProxyOptions::resolve(Some(OptionsPatch {
            strict: Some(strict),
            ..Default::default()
        })))
    }

    fn interceptor(stream: DuplexStream, strict: bool) -> ConnectionInterceptor<DuplexStream> {
        ConnectionInterceptor::new(stream, options(strict)).socket_addrs(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn transparency_v1() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"PROXY TCP4 10.10.10.1 10.10.10.254 12456 80\r\nhello world")
            .await
            .unwrap();
        drop(client);

        let mut conn = interceptor(server, true).negotiate().await.unwrap();
        assert_eq!(conn.client_addr(), Some("10.10.10.1:12456".parse().unwrap()));
        assert_eq!(conn.proxy_addr(), Some("10.10.10.254:80".parse().unwrap()));
        assert_eq!(conn.remote_addr(), Some("10.10.10.1:12456".parse().unwrap()));

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"hello world");
    }

    #[tokio::test]
    async fn transparency_v2() {
        let info = crate::proxy::detector::EndpointInfo {
            client: "192.168.0.254:443".parse().unwrap(),
            proxy: "192.168.0.1:3350".parse().unwrap(),
            version: ProxyVersion::V2,
        };
        let (mut client, server) = duplex(1024);
        client.write_all(&encode_v2(&info).unwrap()).await.unwrap();
        client.write_all(b"payload").await.unwrap();
        drop(client);

        let mut conn = interceptor(server, true).negotiate().await.unwrap();
        assert_eq!(conn.endpoint(), Some(&info));

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"payload");
    }

    #[tokio::test]
    async fn header_split_across_reads() {
        let (mut client, server) = duplex(1024);
        let task = tokio::spawn(async move {
            client.write_all(b"PROXY TCP4 10.0.0.1 ").await.unwrap();
            client.flush().await.unwrap();
            tokio::task::yield_now().await;
            client.write_all(b"10.0.0.2 1000 2000\r\nrest").await.unwrap();
            drop(client);
        });

        let mut conn = interceptor(server, true).negotiate().await.unwrap();
        task.await.unwrap();
        assert_eq!(conn.client_addr(), Some("10.0.0.1:1000".parse().unwrap()));

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"rest");
    }

    #[tokio::test]
    async fn strict_rejects_non_proxy() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"TELNET BABY").await.unwrap();

        let err = interceptor(server, true).negotiate().await.unwrap_err();
        assert_eq!(err.to_string(), "non-PROXY protocol connection");
        assert_eq!(err.header(), "TELNET BABY");
        assert!(err.strict_violation());
    }

    #[tokio::test]
    async fn non_strict_passes_through_untouched() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"TELNET BABY").await.unwrap();
        drop(client);

        let mut conn = interceptor(server, false).negotiate().await.unwrap();
        assert!(conn.endpoint().is_none());

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"TELNET BABY");
    }

    #[tokio::test]
    async fn truncated_header_then_disconnect_is_rejected_when_strict() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"PRO").await.unwrap();
        drop(client);

        let err = interceptor(server, true).negotiate().await.unwrap_err();
        assert_eq!(err.to_string(), "non-PROXY protocol connection");
        assert_eq!(err.header(), "PRO");
    }

    #[tokio::test]
    async fn malformed_header_is_rejected_when_strict() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"PROXY HACK ATTEMPT\r\n").await.unwrap();

        let err = interceptor(server, true).negotiate().await.unwrap_err();
        assert_eq!(err.to_string(), "PROXY protocol malformed header");
        assert!(err.strict_violation());
    }

    #[tokio::test]
    async fn malformed_header_is_stripped_when_not_strict() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"PROXY HACK ATTEMPT\r\nbody").await.unwrap();
        drop(client);

        let mut conn = interceptor(server, false).negotiate().await.unwrap();
        assert!(conn.endpoint().is_none());

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert_eq!(payload, b"body");
    }

    #[tokio::test]
    async fn oversized_header_is_fatal_regardless_of_strictness() {
        let (mut client, server) = duplex(1024);
        let mut junk = b"PROXY TCP4 ".to_vec();
        junk.extend(std::iter::repeat(b'9').take(150));
        client.write_all(&junk).await.unwrap();

        let err = interceptor(server, false).negotiate().await.unwrap_err();
        assert_eq!(err.to_string(), "PROXY header too long");
        assert!(!err.strict_violation());
    }

    #[tokio::test]
    async fn empty_close_resolves_with_eof_replay() {
        let (client, server) = duplex(1024);
        drop(client);

        let mut conn = interceptor(server, true).negotiate().await.unwrap();
        assert!(conn.endpoint().is_none());

        let mut payload = Vec::new();
        conn.read_to_end(&mut payload).await.unwrap();
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn read_error_is_treated_like_end_of_stream() {
        let stream = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();

        let conn = ConnectionInterceptor::new(stream, options(true))
            .negotiate()
            .await
            .unwrap();
        assert!(conn.endpoint().is_none());
    }

    #[tokio::test]
    async fn idle_timeout_ends_connection() {
        let (client, server) = duplex(1024);

        let conn = interceptor(server, true)
            .idle_timeout(Some(Duration::from_millis(20)))
            .negotiate()
            .await
            .unwrap();
        assert!(conn.endpoint().is_none());
        drop(client);
    }

    #[tokio::test]
    async fn remote_accessors_without_override() {
        let (mut client, server) = duplex(1024);
        client
            .write_all(b"PROXY TCP4 10.10.10.1 10.10.10.254 12456 80\r\n")
            .await
            .unwrap();
        drop(client);

        let opts = Arc::new(ProxyOptions::resolve(Some(OptionsPatch {
            override_remote: Some(false),
            ..Default::default()
        })));
        let conn = ConnectionInterceptor::new(server, opts)
            .socket_addrs("127.0.0.1:40000".parse().unwrap(), "127.0.0.1:8080".parse().unwrap())
            .negotiate()
            .await
            .unwrap();

        assert_eq!(conn.client_addr(), Some("10.10.10.1:12456".parse().unwrap()));
        assert_eq!(conn.remote_addr(), Some("127.0.0.1:40000".parse().unwrap()));
        assert_eq!(conn.remote_port(), Some(40000));
        assert_eq!(conn.local_addr(), Some("127.0.0.1:8080".parse().unwrap()));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let (mut client, server) = duplex(1024);
        client.write_all(b"junk").await.unwrap();

        let mut interceptor = interceptor(server, true);
        assert!(interceptor.teardown());
        assert!(!interceptor.teardown());
        assert_eq!(interceptor.state, State::Destroyed);
    }

    #[tokio::test]
    async fn unread_replays_before_inner_stream() {
        let (mut client, server) = duplex(1024);
        client.write_all(b" world").await.unwrap();
        drop(client);

        let mut conn = ProxiedStream::passthrough(
            server,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        );
        conn.unread(Bytes::from_static(b"hello"));

        let mut all = Vec::new();
        conn.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello world");
    }
}
