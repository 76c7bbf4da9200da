//! Outbound writer task.
//!
//! One writer per socket generation. It owns that generation's queue
//! receiver outright: on reconnect the connection swaps in a fresh
//! channel, so frames queued against the new socket can never be picked
//! up by a stale writer.
//!
//! Frames are coalesced into vectored writes of up to [`MAX_BATCH`]
//! buffers and the stream is flushed only once the queue runs dry.

use std::io::{self, IoSlice};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::connection::Lifecycle;
use crate::error::{Error, Result};

/// Upper bound on buffers per vectored write.
const MAX_BATCH: usize = 64;

/// Pump frames from the queue to the socket until the queue closes, the
/// generation goes stale, or an I/O error occurs.
///
/// Returns `Ok(())` on orderly exit; only I/O failures are errors.
pub(crate) async fn writer_loop<W>(
    mut wr: W,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut lifecycle: watch::Receiver<Lifecycle>,
    generation: u64,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Vec<u8>> = Vec::with_capacity(MAX_BATCH);

    loop {
        if lifecycle.borrow().is_stale(generation) {
            return Ok(());
        }

        let first = tokio::select! {
            frame = rx.recv() => frame,
            res = lifecycle.changed() => {
                if res.is_err() {
                    return Ok(());
                }
                continue;
            }
        };

        let Some(first) = first else {
            // All senders gone; this generation is finished.
            return Ok(());
        };

        batch.clear();
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        trace!(frames = batch.len(), "writing batch");
        write_batch(&mut wr, &batch).await?;

        if rx.is_empty() {
            wr.flush().await?;
        }
    }
}

/// Write every frame in the batch, resuming correctly across partial
/// vectored writes.
async fn write_batch<W>(wr: &mut W, batch: &[Vec<u8>]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Vec::len).sum();
    let mut written = 0usize;

    while written < total {
        let mut slices = Vec::with_capacity(batch.len());
        let mut skip = written;
        for frame in batch {
            if skip >= frame.len() {
                skip -= frame.len();
                continue;
            }
            slices.push(IoSlice::new(&frame[skip..]));
            skip = 0;
        }

        let n = wr.write_vectored(&slices).await?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "socket accepted no bytes",
            )));
        }
        written += n;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn lifecycle(generation: u64) -> (watch::Sender<Lifecycle>, watch::Receiver<Lifecycle>) {
        watch::channel(Lifecycle {
            generation,
            closed: false,
        })
    }

    #[tokio::test]
    async fn test_frames_reach_socket_in_order() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel(8);
        let (_lc_tx, lc_rx) = lifecycle(1);

        let writer = tokio::spawn(writer_loop(client, rx, lc_rx, 1));

        tx.send(vec![1, 2, 3]).await.unwrap();
        tx.send(vec![4, 5]).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);

        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_exits_when_generation_goes_stale() {
        let (client, _server) = tokio::io::duplex(1024);
        let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
        let (lc_tx, lc_rx) = lifecycle(1);

        let writer = tokio::spawn(writer_loop(client, rx, lc_rx, 1));

        lc_tx
            .send(Lifecycle {
                generation: 2,
                closed: false,
            })
            .unwrap();

        writer.await.unwrap().unwrap();
        drop(tx);
    }

    #[tokio::test]
    async fn test_partial_write_resumes() {
        // A tiny duplex buffer forces many partial vectored writes.
        let (client, mut server) = tokio::io::duplex(4);
        let (tx, rx) = mpsc::channel(8);
        let (_lc_tx, lc_rx) = lifecycle(1);

        let writer = tokio::spawn(writer_loop(client, rx, lc_rx, 1));

        let payload: Vec<u8> = (0..=255).collect();
        tx.send(payload.clone()).await.unwrap();
        drop(tx);

        let mut out = Vec::new();
        server.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);

        writer.await.unwrap().unwrap();
    }
}
