//! Unified plain/TLS client transport, grounded on
//! `cpkb-bluezoo-tagliacarte`'s `protocol/http/connection.rs` (`HttpStream`'s
//! enum-dispatch `AsyncRead`/`AsyncWrite`) and `net.rs`'s implicit-TLS dial.

use crate::{client::tls, errors::ClientErrorKind, limits::ClientLimits};
use rustls::pki_types::ServerName;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
    time::timeout,
};
use tokio_rustls::client::TlsStream;

/// A client connection, either plain TCP or TLS-wrapped. Exposed as the `IO`
/// parameter of a [`crate::websocket::WebSocket`] returned by
/// [`crate::Client::websocket`]; otherwise only ever seen inside the pool.
pub enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub(crate) async fn connect(host: &str, port: u16, use_tls: bool, limits: &ClientLimits) -> Result<Self, ClientErrorKind> {
        let addr = format!("{host}:{port}");
        let tcp = match timeout(limits.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout").into()),
        };
        let _ = tcp.set_nodelay(true);

        if !use_tls {
            return Ok(Self::Plain(tcp));
        }

        let connector = tls::connector()?;
        // `ServerName` must be `'static`; the connector is process-wide and
        // outlives any single connect, so the leak is bounded by the number
        // of distinct hosts a process ever dials, not by connection count.
        let host_static: &'static str = Box::leak(host.to_string().into_boxed_str());
        let server_name = ServerName::try_from(host_static)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid host name"))?;

        let tls_stream = match timeout(limits.connect_timeout, connector.connect(server_name, tcp)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ClientErrorKind::TlsInitializationFailed(e.to_string())),
            Err(_) => return Err(io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timeout").into()),
        };
        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

impl AsyncRead for Stream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Wraps a stream with bytes already read off the wire but not yet
/// consumed. The WebSocket upgrade handshake reads off a growable buffer
/// that may have pulled in the first frame along with the `101` response;
/// this replays that leftover before falling through to the live socket.
pub struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prefixed<S> {
    pub(crate) fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self { prefix, pos: 0, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = self.prefix.len() - self.pos;
            let n = remaining.min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
