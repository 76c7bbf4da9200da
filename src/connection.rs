//! Connection lifecycle and the public request surface.
//!
//! One `Connection` owns one logical link to the server. Internally a
//! socket generation is the unit of recovery: every dial installs a
//! fresh socket, a fresh outbound queue, and a fresh reader/writer task
//! pair, all tagged with a bumped generation number. Stale tasks observe
//! the bump through a watch channel and exit on their own; they never
//! touch a socket they no longer own.
//!
//! State machine: `disconnected -> connected -> (disconnected | closed)`,
//! with `closed` absorbing. The state byte lives in an atomic checked
//! under the pending-table shard locks, so request admission and the
//! bulk drains on disconnect/close can never interleave badly.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::auth::{authenticate, read_greeting, Greeting};
use crate::deadline::DeadlineStream;
use crate::error::{Error, Result};
use crate::future::RequestFuture;
use crate::pending::{Pending, PendingTable};
use crate::protocol::{BufferPool, Request, Response};
use crate::reader::reader_loop;
use crate::schema::Schema;
use crate::transport;
use crate::tuple::encode_tuple;
use crate::writer::writer_loop;

pub(crate) const STATE_DISCONNECTED: u8 = 0;
pub(crate) const STATE_CONNECTED: u8 = 1;
pub(crate) const STATE_CLOSED: u8 = 2;

/// Read-side buffer in front of the socket.
const READ_BUFFER_SIZE: usize = 128 * 1024;

/// Floor for the self-adjusting sweep timer.
const MIN_SWEEP_DELAY: Duration = Duration::from_millis(10);

/// Broadcast value every background task watches.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lifecycle {
    pub generation: u64,
    pub closed: bool,
}

impl Lifecycle {
    pub fn is_stale(&self, generation: u64) -> bool {
        self.closed || self.generation != generation
    }
}

/// Connection options.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Per-request deadline; `None` means requests never time out.
    pub timeout: Option<Duration>,
    /// Pause between reconnect attempts; `None` disables reconnection
    /// and makes any transport failure terminal.
    pub reconnect: Option<Duration>,
    /// Cap on consecutive failed reconnect attempts; 0 means unbounded.
    pub max_reconnects: u32,
    /// User name; omit to skip authentication.
    pub user: Option<String>,
    pub pass: String,
    /// Shard-count hint, rounded up to the next power of two; 0 picks a
    /// default from available parallelism.
    pub concurrency: u32,
    /// Skip loading space/index metadata at connect time.
    pub skip_schema: bool,
}

impl Default for Opts {
    fn default() -> Self {
        Opts {
            timeout: None,
            reconnect: None,
            max_reconnects: 0,
            user: None,
            pass: String::new(),
            concurrency: 0,
            skip_schema: false,
        }
    }
}

struct Manager {
    generation: u64,
}

struct ConnInner {
    addr: String,
    opts: Opts,
    state: AtomicU8,
    request_id: AtomicU32,
    pending: Arc<PendingTable>,
    queue_tx: PlMutex<mpsc::Sender<Vec<u8>>>,
    queue_capacity: usize,
    lifecycle_tx: watch::Sender<Lifecycle>,
    manager: AsyncMutex<Manager>,
    pool: BufferPool,
    greeting: PlMutex<Option<Greeting>>,
    schema: PlMutex<Option<Arc<Schema>>>,
}

/// Handle to one logical server connection. Cheap to clone; all clones
/// share the same underlying link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dial, greet, authenticate, and start the background tasks.
    ///
    /// With a reconnect policy configured, dial failures are retried
    /// with the configured pause (bounded by `max_reconnects`);
    /// authentication failures always surface immediately.
    pub async fn connect(addr: &str, opts: Opts) -> Result<Connection> {
        let concurrency = normalize_concurrency(opts.concurrency);
        let queue_capacity = (concurrency as usize * 4).max(64);

        // Placeholder channel; every dial installs its own.
        let (queue_tx, _) = mpsc::channel(1);
        let (lifecycle_tx, _) = watch::channel(Lifecycle {
            generation: 0,
            closed: false,
        });

        let inner = Arc::new(ConnInner {
            addr: addr.to_string(),
            opts,
            state: AtomicU8::new(STATE_DISCONNECTED),
            request_id: AtomicU32::new(0),
            pending: Arc::new(PendingTable::new(concurrency)),
            queue_tx: PlMutex::new(queue_tx),
            queue_capacity,
            lifecycle_tx,
            manager: AsyncMutex::new(Manager { generation: 0 }),
            pool: BufferPool::new(),
            greeting: PlMutex::new(None),
            schema: PlMutex::new(None),
        });

        {
            let mut mgr = inner.manager.lock().await;
            let mut attempts = 0u32;
            loop {
                match dial(&inner, &mut mgr).await {
                    Ok(()) => break,
                    Err(err) if err.is_auth_failure() => return Err(err),
                    Err(err) => {
                        let Some(pause) = inner.opts.reconnect else {
                            return Err(err);
                        };
                        attempts += 1;
                        if inner.opts.max_reconnects > 0 && attempts >= inner.opts.max_reconnects
                        {
                            return Err(err);
                        }
                        warn!(%err, attempts, "connect failed, retrying");
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        }

        let conn = Connection { inner };

        if let Some(timeout) = conn.inner.opts.timeout {
            let lc = conn.inner.lifecycle_tx.subscribe();
            tokio::spawn(run_sweeper(Arc::downgrade(&conn.inner), lc, timeout));
        }
        {
            let lc = conn.inner.lifecycle_tx.subscribe();
            tokio::spawn(run_pinger(Arc::downgrade(&conn.inner), lc));
        }

        if !conn.inner.opts.skip_schema {
            match Schema::load(&conn).await {
                Ok(schema) => *conn.inner.schema.lock() = Some(Arc::new(schema)),
                Err(err) => {
                    // Don't leave a half-initialized connection running.
                    conn.close().await;
                    return Err(err);
                }
            }
        }

        Ok(conn)
    }

    /// Whether the link is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    /// Whether the connection has been permanently closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Greeting from the most recent successful handshake.
    pub fn greeting(&self) -> Option<Greeting> {
        self.inner.greeting.lock().clone()
    }

    /// Space/index metadata loaded at connect time, unless skipped.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.inner.schema.lock().clone()
    }

    /// Permanently close the connection.
    ///
    /// Idempotent. Every in-flight request fails with a closed error and
    /// all background tasks shut down; any later request fails
    /// immediately.
    pub async fn close(&self) {
        let mut mgr = self.inner.manager.lock().await;
        if self.inner.state.load(Ordering::Acquire) == STATE_CLOSED {
            return;
        }

        info!("closing connection");
        let drained = self
            .inner
            .pending
            .drain_all_with_state(&self.inner.state, STATE_CLOSED);
        fail_all(drained, || {
            Error::ConnectionClosed("connection closed by client")
        });

        mgr.generation += 1;
        let _ = self.inner.lifecycle_tx.send_replace(Lifecycle {
            generation: mgr.generation,
            closed: true,
        });
    }

    /// Register, encode, and enqueue one request.
    async fn issue(&self, request: Request) -> RequestFuture {
        let inner = &self.inner;

        let sync = inner
            .request_id
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        let deadline = inner.opts.timeout.map(|t| Instant::now() + t);

        let rx = match inner.pending.register(sync, deadline, &inner.state) {
            Ok(rx) => rx,
            Err(err) => return RequestFuture::failed(err),
        };

        let frame = match request.encode_frame(sync) {
            Ok(frame) => frame,
            Err(err) => {
                inner.pending.remove(sync);
                return RequestFuture::failed(err);
            }
        };

        let tx = inner.queue_tx.lock().clone();
        if tx.send(frame).await.is_err() {
            // Queue torn down between register and send; if the drain
            // missed this entry, fail it here.
            if inner.pending.remove(sync).is_some() {
                return RequestFuture::failed(Error::ConnectionNotReady);
            }
        }

        RequestFuture::new(sync, rx)
    }

    pub async fn ping_async(&self) -> RequestFuture {
        self.issue(Request::Ping).await
    }

    pub async fn ping(&self) -> Result<Response> {
        self.ping_async().await.resolve().await
    }

    pub async fn select_async<K: Serialize>(
        &self,
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: &K,
    ) -> RequestFuture {
        let key = match encode_tuple(key) {
            Ok(key) => key,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Select {
            space,
            index,
            offset,
            limit,
            iterator,
            key,
        })
        .await
    }

    pub async fn select<K: Serialize>(
        &self,
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: &K,
    ) -> Result<Response> {
        self.select_async(space, index, offset, limit, iterator, key)
            .await
            .resolve()
            .await
    }

    pub async fn insert_async<T: Serialize>(&self, space: u32, tuple: &T) -> RequestFuture {
        let tuple = match encode_tuple(tuple) {
            Ok(tuple) => tuple,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Insert { space, tuple }).await
    }

    pub async fn insert<T: Serialize>(&self, space: u32, tuple: &T) -> Result<Response> {
        self.insert_async(space, tuple).await.resolve().await
    }

    pub async fn replace_async<T: Serialize>(&self, space: u32, tuple: &T) -> RequestFuture {
        let tuple = match encode_tuple(tuple) {
            Ok(tuple) => tuple,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Replace { space, tuple }).await
    }

    pub async fn replace<T: Serialize>(&self, space: u32, tuple: &T) -> Result<Response> {
        self.replace_async(space, tuple).await.resolve().await
    }

    pub async fn delete_async<K: Serialize>(
        &self,
        space: u32,
        index: u32,
        key: &K,
    ) -> RequestFuture {
        let key = match encode_tuple(key) {
            Ok(key) => key,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Delete { space, index, key }).await
    }

    pub async fn delete<K: Serialize>(&self, space: u32, index: u32, key: &K) -> Result<Response> {
        self.delete_async(space, index, key).await.resolve().await
    }

    pub async fn update_async<K: Serialize, O: Serialize>(
        &self,
        space: u32,
        index: u32,
        key: &K,
        ops: &O,
    ) -> RequestFuture {
        let (key, ops) = match encode_tuple(key).and_then(|k| Ok((k, encode_tuple(ops)?))) {
            Ok(pair) => pair,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Update {
            space,
            index,
            key,
            ops,
        })
        .await
    }

    pub async fn update<K: Serialize, O: Serialize>(
        &self,
        space: u32,
        index: u32,
        key: &K,
        ops: &O,
    ) -> Result<Response> {
        self.update_async(space, index, key, ops)
            .await
            .resolve()
            .await
    }

    pub async fn upsert_async<T: Serialize, O: Serialize>(
        &self,
        space: u32,
        tuple: &T,
        ops: &O,
    ) -> RequestFuture {
        let (key, ops) = match encode_tuple(tuple).and_then(|k| Ok((k, encode_tuple(ops)?))) {
            Ok(pair) => pair,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Upsert { space, key, ops }).await
    }

    pub async fn upsert<T: Serialize, O: Serialize>(
        &self,
        space: u32,
        tuple: &T,
        ops: &O,
    ) -> Result<Response> {
        self.upsert_async(space, tuple, ops).await.resolve().await
    }

    /// Call a stored function with 1.6-era result framing.
    pub async fn call_async<A: Serialize>(&self, function: &str, args: &A) -> RequestFuture {
        let args = match encode_tuple(args) {
            Ok(args) => args,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Call {
            function: function.to_string(),
            args,
        })
        .await
    }

    pub async fn call<A: Serialize>(&self, function: &str, args: &A) -> Result<Response> {
        self.call_async(function, args).await.resolve().await
    }

    /// Call a stored function with 1.7+ result framing.
    pub async fn call17_async<A: Serialize>(&self, function: &str, args: &A) -> RequestFuture {
        let args = match encode_tuple(args) {
            Ok(args) => args,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Call17 {
            function: function.to_string(),
            args,
        })
        .await
    }

    pub async fn call17<A: Serialize>(&self, function: &str, args: &A) -> Result<Response> {
        self.call17_async(function, args).await.resolve().await
    }

    pub async fn eval_async<A: Serialize>(&self, expression: &str, args: &A) -> RequestFuture {
        let args = match encode_tuple(args) {
            Ok(args) => args,
            Err(err) => return RequestFuture::failed(err),
        };
        self.issue(Request::Eval {
            expression: expression.to_string(),
            args,
        })
        .await
    }

    pub async fn eval<A: Serialize>(&self, expression: &str, args: &A) -> Result<Response> {
        self.eval_async(expression, args).await.resolve().await
    }
}

fn normalize_concurrency(hint: u32) -> u32 {
    let maxprocs = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1);

    let mut c = hint;
    if c == 0 || c > maxprocs.saturating_mul(128) {
        c = maxprocs * 4;
    }
    c.next_power_of_two()
}

fn connect_timeout(opts: &Opts) -> Duration {
    match opts.reconnect {
        Some(pause) => (pause / 2).clamp(Duration::from_millis(500), Duration::from_secs(5)),
        None => opts.timeout.unwrap_or(Duration::from_secs(1)),
    }
}

fn fail_all(drained: Vec<Pending>, mut make: impl FnMut() -> Error) {
    for entry in drained {
        let _ = entry.tx.send(Err(make()));
    }
}

/// One dial attempt: connect, greet, authenticate, install the new
/// socket generation. Caller holds the manager lock.
///
/// Returns a boxed future to break the recursive future cycle
/// (dial -> run_reader -> reconnect_loop -> dial) that otherwise
/// defeats `Send` auto-trait inference.
fn dial<'a>(
    inner: &'a Arc<ConnInner>,
    mgr: &'a mut Manager,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(dial_inner(inner, mgr))
}

async fn dial_inner(inner: &Arc<ConnInner>, mgr: &mut Manager) -> Result<()> {
    let sock = transport::connect(&inner.addr, connect_timeout(&inner.opts)).await?;
    // The read direction gets double slack so a silent server expires
    // individual requests through the sweeper before the socket itself
    // is declared dead.
    let mut sock = DeadlineStream::new(
        sock,
        inner.opts.timeout.map(|t| t * 2),
        inner.opts.timeout,
    );

    let greeting = read_greeting(&mut sock).await?;
    debug!(version = %greeting.version, "greeted");

    if let Some(user) = &inner.opts.user {
        authenticate(&mut sock, user, &inner.opts.pass, &greeting, &inner.pool).await?;
    }
    *inner.greeting.lock() = Some(greeting);

    mgr.generation += 1;
    let generation = mgr.generation;

    let (queue_tx, queue_rx) = mpsc::channel(inner.queue_capacity);
    *inner.queue_tx.lock() = queue_tx;

    inner.state.store(STATE_CONNECTED, Ordering::Release);
    let _ = inner.lifecycle_tx.send_replace(Lifecycle {
        generation,
        closed: false,
    });

    let (rd, wr) = tokio::io::split(sock);
    let rd = BufReader::with_capacity(READ_BUFFER_SIZE, rd);

    tokio::spawn(run_reader(Arc::clone(inner), rd, generation));
    tokio::spawn(run_writer(Arc::clone(inner), wr, queue_rx, generation));

    info!(addr = %inner.addr, generation, "connected");
    Ok(())
}

async fn run_reader<R>(inner: Arc<ConnInner>, rd: R, generation: u64)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let lc = inner.lifecycle_tx.subscribe();
    if let Err(err) = reader_loop(
        rd,
        inner.pool.clone(),
        Arc::clone(&inner.pending),
        lc,
        generation,
    )
    .await
    {
        handle_disconnect(&inner, generation, err).await;
    }
}

async fn run_writer<W>(
    inner: Arc<ConnInner>,
    wr: W,
    queue_rx: mpsc::Receiver<Vec<u8>>,
    generation: u64,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    let lc = inner.lifecycle_tx.subscribe();
    if let Err(err) = writer_loop(wr, queue_rx, lc, generation).await {
        handle_disconnect(&inner, generation, err).await;
    }
}

/// React to an I/O failure on the socket of the given generation.
///
/// Whichever of the reader/writer pair fails first wins the manager
/// lock and performs the teardown; the loser sees a stale generation
/// and returns.
async fn handle_disconnect(inner: &Arc<ConnInner>, generation: u64, err: Error) {
    let new_generation;
    {
        let mut mgr = inner.manager.lock().await;
        if mgr.generation != generation
            || inner.state.load(Ordering::Acquire) == STATE_CLOSED
        {
            return;
        }
        warn!(%err, generation, "connection lost");

        match inner.opts.reconnect {
            None => {
                let drained = inner
                    .pending
                    .drain_all_with_state(&inner.state, STATE_CLOSED);
                fail_all(drained, || {
                    Error::ConnectionClosed("connection closed by peer")
                });
                mgr.generation += 1;
                let _ = inner.lifecycle_tx.send_replace(Lifecycle {
                    generation: mgr.generation,
                    closed: true,
                });
                return;
            }
            Some(_) => {
                let drained = inner
                    .pending
                    .drain_all_with_state(&inner.state, STATE_DISCONNECTED);
                fail_all(drained, || Error::ConnectionNotReady);
                mgr.generation += 1;
                new_generation = mgr.generation;
                let _ = inner.lifecycle_tx.send_replace(Lifecycle {
                    generation: new_generation,
                    closed: false,
                });
            }
        }
    }

    reconnect_loop(inner, new_generation).await;
}

/// Retry dialing until success, permanent close, or attempt exhaustion.
///
/// The manager lock is re-taken per attempt so `close` can interleave
/// with the pauses between attempts.
async fn reconnect_loop(inner: &Arc<ConnInner>, my_generation: u64) {
    let Some(pause) = inner.opts.reconnect else {
        return;
    };

    let mut attempts = 0u32;
    loop {
        tokio::time::sleep(pause).await;

        let mut mgr = inner.manager.lock().await;
        if inner.state.load(Ordering::Acquire) == STATE_CLOSED || mgr.generation != my_generation
        {
            return;
        }

        match dial(inner, &mut mgr).await {
            Ok(()) => {
                info!(attempts, "reconnected");
                return;
            }
            Err(err) if err.is_auth_failure() => {
                error!(%err, "authentication rejected, closing");
                close_forever(inner, &mut mgr);
                return;
            }
            Err(err) => {
                attempts += 1;
                warn!(%err, attempts, "reconnect attempt failed");
                if inner.opts.max_reconnects > 0 && attempts >= inner.opts.max_reconnects {
                    error!(attempts, "reconnect attempts exhausted, closing");
                    close_forever(inner, &mut mgr);
                    return;
                }
            }
        }
    }
}

fn close_forever(inner: &Arc<ConnInner>, mgr: &mut Manager) {
    let drained = inner
        .pending
        .drain_all_with_state(&inner.state, STATE_CLOSED);
    fail_all(drained, || Error::ConnectionClosed("connection closed"));

    mgr.generation += 1;
    let _ = inner.lifecycle_tx.send_replace(Lifecycle {
        generation: mgr.generation,
        closed: true,
    });
}

/// Fail requests whose deadline has passed. Self-adjusting: sleeps until
/// the earliest pending deadline rather than polling a fixed interval.
async fn run_sweeper(
    inner: Weak<ConnInner>,
    mut lifecycle: watch::Receiver<Lifecycle>,
    timeout: Duration,
) {
    let mut next_at = Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_at) => {}
            res = lifecycle.changed() => {
                if res.is_err() || lifecycle.borrow().closed {
                    return;
                }
                continue;
            }
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };

        let now = Instant::now();
        let (expired, next) = inner.pending.sweep_expired(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expiring timed-out requests");
        }
        for entry in expired {
            let _ = entry.tx.send(Err(Error::Timeout(entry.sync)));
        }

        next_at = next.unwrap_or(now + timeout).max(now + MIN_SWEEP_DELAY);
    }
}

/// Issue a keepalive on a timer of one third of the request timeout
/// (1s when no timeout is configured). Failures surface through the
/// normal disconnect path via the reader.
async fn run_pinger(inner: Weak<ConnInner>, mut lifecycle: watch::Receiver<Lifecycle>) {
    let period = {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        strong
            .opts
            .timeout
            .map(|t| t / 3)
            .unwrap_or(Duration::from_secs(1))
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            res = lifecycle.changed() => {
                if res.is_err() || lifecycle.borrow().closed {
                    return;
                }
                continue;
            }
        }

        let Some(strong) = inner.upgrade() else {
            return;
        };
        let conn = Connection { inner: strong };
        if !conn.is_connected() {
            continue;
        }

        if let Err(err) = conn.ping().await {
            debug!(%err, "keepalive ping failed");
        }
    }
}
