//! Per-request completion handle.

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::Response;

enum Inner {
    Waiting(oneshot::Receiver<Result<Response>>),
    Failed(Option<Error>),
}

/// Handle to one in-flight request.
///
/// Obtained from the `*_async` methods on
/// [`Connection`](crate::Connection); resolving it waits for the
/// response (or the timeout, disconnect, or close that preempts it).
pub struct RequestFuture {
    sync: u32,
    inner: Inner,
}

impl RequestFuture {
    pub(crate) fn new(sync: u32, rx: oneshot::Receiver<Result<Response>>) -> Self {
        RequestFuture {
            sync,
            inner: Inner::Waiting(rx),
        }
    }

    /// A future that was dead on arrival (send failed before the request
    /// ever hit the wire).
    pub(crate) fn failed(err: Error) -> Self {
        RequestFuture {
            sync: 0,
            inner: Inner::Failed(Some(err)),
        }
    }

    /// Request identifier, 0 for dead-on-arrival futures.
    pub fn sync(&self) -> u32 {
        self.sync
    }

    /// Wait for the response and convert server-reported failures into
    /// errors.
    pub async fn resolve(self) -> Result<Response> {
        match self.inner {
            Inner::Waiting(rx) => match rx.await {
                Ok(result) => result?.into_result(),
                // Sender dropped without a verdict: the connection was
                // torn down out from under us.
                Err(_) => Err(Error::ConnectionClosed("connection shut down")),
            },
            Inner::Failed(mut err) => Err(err
                .take()
                .unwrap_or(Error::ConnectionClosed("request never sent"))),
        }
    }
}
