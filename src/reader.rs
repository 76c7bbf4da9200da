//! Inbound reader task.
//!
//! One reader per socket generation: reads frames, decodes response
//! envelopes, and hands each to the matching pending entry. Responses
//! whose sync is no longer registered (already timed out or drained) are
//! dropped.

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tracing::debug;

use crate::connection::Lifecycle;
use crate::error::Result;
use crate::pending::PendingTable;
use crate::protocol::{read_frame, BufferPool, Response};

/// Read and dispatch responses until the generation goes stale or an
/// I/O or protocol error occurs.
pub(crate) async fn reader_loop<R>(
    mut rd: R,
    pool: BufferPool,
    pending: Arc<PendingTable>,
    mut lifecycle: watch::Receiver<Lifecycle>,
    generation: u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let body = tokio::select! {
            res = read_frame(&mut rd, &pool) => res?,
            _ = wait_stale(&mut lifecycle, generation) => return Ok(()),
        };

        let response = Response::decode(body)?;
        match pending.remove(response.sync) {
            Some(entry) => {
                // The receiver may already be gone; nothing to do then.
                let _ = entry.tx.send(Ok(response));
            }
            None => debug!(sync = response.sync, "dropping response for unknown sync"),
        }
    }
}

async fn wait_stale(lifecycle: &mut watch::Receiver<Lifecycle>, generation: u64) {
    loop {
        if lifecycle.borrow().is_stale(generation) {
            return;
        }
        if lifecycle.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::STATE_CONNECTED;
    use crate::protocol::{KEY_CODE, KEY_DATA, KEY_SYNC, OK_CODE};
    use rmp::encode::{write_map_len, write_uint};
    use std::sync::atomic::AtomicU8;
    use tokio::io::AsyncWriteExt;

    fn response_frame(sync: u32, value: u64) -> Vec<u8> {
        let mut body = Vec::new();
        write_map_len(&mut body, 2).unwrap();
        write_uint(&mut body, KEY_CODE as u64).unwrap();
        write_uint(&mut body, OK_CODE as u64).unwrap();
        write_uint(&mut body, KEY_SYNC as u64).unwrap();
        write_uint(&mut body, sync as u64).unwrap();
        write_map_len(&mut body, 1).unwrap();
        write_uint(&mut body, KEY_DATA as u64).unwrap();
        write_uint(&mut body, value).unwrap();

        let mut frame = vec![0xce];
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    #[tokio::test]
    async fn test_dispatches_response_to_pending_entry() {
        let (client, mut server) = tokio::io::duplex(1024);
        let pending = Arc::new(PendingTable::new(4));
        let state = AtomicU8::new(STATE_CONNECTED);
        let (_lc_tx, lc_rx) = watch::channel(Lifecycle {
            generation: 1,
            closed: false,
        });

        let rx = pending.register(9, None, &state).unwrap();
        let reader = tokio::spawn(reader_loop(
            client,
            BufferPool::new(),
            Arc::clone(&pending),
            lc_rx,
            1,
        ));

        server.write_all(&response_frame(9, 42)).await.unwrap();

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.sync, 9);
        assert_eq!(response.decode_data::<u64>().unwrap(), 42);

        reader.abort();
    }

    #[tokio::test]
    async fn test_unknown_sync_dropped_without_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        let pending = Arc::new(PendingTable::new(4));
        let state = AtomicU8::new(STATE_CONNECTED);
        let (_lc_tx, lc_rx) = watch::channel(Lifecycle {
            generation: 1,
            closed: false,
        });

        let rx = pending.register(2, None, &state).unwrap();
        let reader = tokio::spawn(reader_loop(
            client,
            BufferPool::new(),
            Arc::clone(&pending),
            lc_rx,
            1,
        ));

        // Nothing registered under sync 1; the reader must keep going.
        server.write_all(&response_frame(1, 0)).await.unwrap();
        server.write_all(&response_frame(2, 7)).await.unwrap();

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.sync, 2);

        reader.abort();
    }

    #[tokio::test]
    async fn test_exits_on_close() {
        let (client, _server) = tokio::io::duplex(1024);
        let pending = Arc::new(PendingTable::new(4));
        let (lc_tx, lc_rx) = watch::channel(Lifecycle {
            generation: 1,
            closed: false,
        });

        let reader = tokio::spawn(reader_loop(client, BufferPool::new(), pending, lc_rx, 1));

        lc_tx
            .send(Lifecycle {
                generation: 1,
                closed: true,
            })
            .unwrap();

        reader.await.unwrap().unwrap();
    }
}
