//! Asynchronous Tarantool client.
//!
//! One [`Connection`] multiplexes any number of concurrent callers onto
//! a single socket: requests are pipelined onto the wire by a dedicated
//! writer task and responses are matched back to callers by sync id.
//! Per-request timeouts, keepalive pings, and automatic reconnection
//! are handled internally.
//!
//! ```no_run
//! use tarantool_client::{Connection, Opts, UintKey, ITER_EQ};
//!
//! # async fn run() -> tarantool_client::Result<()> {
//! let conn = Connection::connect("127.0.0.1:3301", Opts::default()).await?;
//!
//! conn.insert(512, &(1u64, "alpha")).await?;
//! let resp = conn.select(512, 0, 0, 1, ITER_EQ, &UintKey(1)).await?;
//! let rows: Vec<(u64, String)> = resp.decode_data()?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod connection;
mod deadline;
mod error;
mod future;
mod pending;
mod protocol;
mod reader;
mod schema;
mod transport;
mod tuple;
mod writer;

pub use auth::Greeting;
pub use connection::{Connection, Opts};
pub use error::{Error, Result};
pub use future::RequestFuture;
pub use protocol::Response;
pub use protocol::{
    ER_NO_SUCH_USER, ER_PASSWORD_MISMATCH, ITER_ALL, ITER_BITS_ALL_NOT_SET, ITER_BITS_ALL_SET,
    ITER_BITS_ANY_SET, ITER_EQ, ITER_GE, ITER_GT, ITER_LE, ITER_LT, ITER_NEIGHBOR, ITER_OVERLAPS,
    ITER_REQ,
};
pub use schema::{Schema, Space};
pub use tuple::{encode_tuple, EmptyKey, IntKey, Op, OpSplice, StringKey, UintKey};
