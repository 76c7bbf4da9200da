//! Socket wrapper enforcing per-direction I/O deadlines.
//!
//! Reader and writer halves block in long poll loops, so a hung peer
//! would otherwise stall them forever. `DeadlineStream` arms a timer the
//! moment a read or write returns `Pending` and fails the operation with
//! `TimedOut` once it fires; any completed operation disarms the timer
//! for that direction.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};

pub(crate) struct DeadlineStream<S> {
    stream: S,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_timer: Option<Pin<Box<Sleep>>>,
}

impl<S> DeadlineStream<S> {
    /// A timeout of `None` disables deadline enforcement for that
    /// direction.
    pub fn new(stream: S, read_timeout: Option<Duration>, write_timeout: Option<Duration>) -> Self {
        DeadlineStream {
            stream,
            read_timeout,
            write_timeout,
            read_timer: None,
            write_timer: None,
        }
    }
}

fn poll_deadline(
    timer: &mut Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    let Some(timeout) = timeout else {
        return Poll::Pending;
    };

    let timer = timer.get_or_insert_with(|| Box::pin(sleep(timeout)));
    timer.as_mut().poll(cx)
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

impl<S: AsyncRead + Unpin> AsyncRead for DeadlineStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.read_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.read_timer, this.read_timeout, cx) {
                Poll::Ready(()) => {
                    this.read_timer = None;
                    Poll::Ready(Err(timed_out()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for DeadlineStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.stream).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.write_timer, this.write_timeout, cx) {
                Poll::Ready(()) => {
                    this.write_timer = None;
                    Poll::Ready(Err(timed_out()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match Pin::new(&mut this.stream).poll_write_vectored(cx, bufs) {
            Poll::Ready(result) => {
                this.write_timer = None;
                Poll::Ready(result)
            }
            Poll::Pending => match poll_deadline(&mut this.write_timer, this.write_timeout, cx) {
                Poll::Ready(()) => {
                    this.write_timer = None;
                    Poll::Ready(Err(timed_out()))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn test_read_times_out_on_silent_peer() {
        let (client, _server) = tokio::io::duplex(64);
        let mut stream = DeadlineStream::new(client, Some(Duration::from_millis(100)), None);

        let mut buf = [0u8; 8];
        let err = stream.read_exact(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_read_disarms_timer() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = DeadlineStream::new(client, Some(Duration::from_millis(100)), None);

        server.write_all(b"hi").await.unwrap();

        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        // A fresh read gets a fresh full deadline.
        tokio::time::sleep(Duration::from_millis(60)).await;
        server.write_all(b"ok").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_no_timeout_passthrough() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = DeadlineStream::new(client, None, None);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
