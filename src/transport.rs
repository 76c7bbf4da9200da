//! Socket dialing and address syntax.
//!
//! Accepted forms: `tcp://host:port`, `tcp:host:port`, plain
//! `host:port` for TCP; `unix:///abs/path`, `unix:path`, `unix/:path`,
//! or a path starting with `/` or `.` for local sockets.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, PartialEq, Eq)]
enum Target<'a> {
    Tcp(&'a str),
    Unix(&'a str),
}

fn parse(addr: &str) -> Target<'_> {
    if let Some(rest) = addr.strip_prefix("tcp://") {
        return Target::Tcp(rest);
    }
    if let Some(rest) = addr.strip_prefix("tcp:") {
        return Target::Tcp(rest);
    }
    if let Some(rest) = addr.strip_prefix("unix://") {
        return Target::Unix(rest);
    }
    if let Some(rest) = addr.strip_prefix("unix/:") {
        return Target::Unix(rest);
    }
    if let Some(rest) = addr.strip_prefix("unix:") {
        return Target::Unix(rest);
    }
    if addr.starts_with('/') || addr.starts_with('.') {
        return Target::Unix(addr);
    }
    Target::Tcp(addr)
}

/// Either kind of connected socket.
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// Dial the server, bounding the whole attempt by `timeout`.
pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<Stream> {
    debug!(%addr, ?timeout, "dialing");

    let dial = async {
        match parse(addr) {
            Target::Tcp(host) => {
                let stream = TcpStream::connect(host).await?;
                // Request frames are small and latency-sensitive.
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Target::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            Target::Unix(_) => Err(Error::Protocol(format!(
                "local sockets unsupported on this platform: {addr}"
            ))),
        }
    };

    tokio::time::timeout(timeout, dial).await.map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {addr} timed out"),
        ))
    })?
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Stream::Tcp(s) => s.is_write_vectored(),
            #[cfg(unix)]
            Stream::Unix(s) => s.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_address_forms() {
        assert_eq!(parse("tcp://db:3301"), Target::Tcp("db:3301"));
        assert_eq!(parse("tcp:db:3301"), Target::Tcp("db:3301"));
        assert_eq!(parse("db:3301"), Target::Tcp("db:3301"));
        assert_eq!(parse("unix:///tmp/db.sock"), Target::Unix("/tmp/db.sock"));
        assert_eq!(parse("unix:db.sock"), Target::Unix("db.sock"));
        assert_eq!(parse("unix/:db.sock"), Target::Unix("db.sock"));
        assert_eq!(parse("/tmp/db.sock"), Target::Unix("/tmp/db.sock"));
        assert_eq!(parse("./db.sock"), Target::Unix("./db.sock"));
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let stream = connect(&addr, Duration::from_secs(1)).await.unwrap();
        match stream {
            Stream::Tcp(s) => assert!(s.peer_addr().is_ok()),
            #[cfg(unix)]
            Stream::Unix(_) => panic!("expected tcp"),
        }
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(connect(&addr, Duration::from_secs(1)).await.is_err());
    }
}
