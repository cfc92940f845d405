//! The byte transport a connection reads and writes: plain TCP, or TCP wrapped in TLS.
//! Grounded on the source's `stream.rs`, which erased the same plain/TLS distinction
//! behind one enum so the rest of the connection never has to match on it.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

pub enum WsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl WsStream {
    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            WsStream::Plain(stream) => stream.peer_addr(),
            WsStream::Tls(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// Sets `TCP_NODELAY`/cork behavior the way the source does around `onReadable`'s
    /// write path, so small frames (pings, acks) aren't held back by Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        match self {
            WsStream::Plain(stream) => stream.set_nodelay(nodelay),
            WsStream::Tls(stream) => stream.get_ref().0.set_nodelay(nodelay),
        }
    }
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            WsStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
