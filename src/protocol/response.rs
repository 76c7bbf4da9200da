//! Response envelope decoding.
//!
//! A response body is two concatenated maps: a header map carrying the
//! echoed sync and the status code, then a body map carrying either a
//! data payload (left opaque here) or an error string. Unknown keys in
//! either map are skipped.

use std::ops::Range;

use rmp::decode::{read_int, read_map_len};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::protocol::buffer_pool::PooledBuf;
use crate::protocol::{ERROR_CODE_BIT, KEY_CODE, KEY_DATA, KEY_ERROR, KEY_SYNC, OK_CODE};

/// One decoded response envelope.
///
/// The data payload stays undecoded; use [`Response::decode_data`] to
/// deserialize it. The backing buffer returns to the connection's pool
/// when the `Response` is dropped.
#[derive(Debug)]
pub struct Response {
    /// Echoed request identifier.
    pub sync: u32,
    /// Status code, with the error-flag bit already masked off non-success
    /// codes.
    pub code: u32,
    /// Error message, present iff the server reported a failure.
    pub error: Option<String>,
    data: Range<usize>,
    buf: PooledBuf,
}

impl Response {
    /// Decode the envelope from a complete frame body.
    pub fn decode(buf: PooledBuf) -> Result<Self> {
        let total = buf.len();
        let mut rd: &[u8] = &buf;

        let mut sync = 0u32;
        let mut code = 0u32;
        let mut error = None;
        let mut data = 0..0;

        let entries = read_map_len(&mut rd)?;
        for _ in 0..entries {
            let key: u8 = read_int(&mut rd)?;
            match key {
                KEY_SYNC => sync = read_int::<u64, _>(&mut rd)? as u32,
                KEY_CODE => code = read_int::<u64, _>(&mut rd)? as u32,
                _ => skip_value(&mut rd)?,
            }
        }

        let entries = read_map_len(&mut rd)?;
        for _ in 0..entries {
            let key: u8 = read_int(&mut rd)?;
            match key {
                KEY_DATA => {
                    let start = total - rd.len();
                    skip_value(&mut rd)?;
                    data = start..total - rd.len();
                }
                KEY_ERROR => error = Some(read_string(&mut rd)?),
                _ => skip_value(&mut rd)?,
            }
        }

        // The error-flag bit is cleared only off non-success codes; the
        // success code itself is never masked.
        if code != OK_CODE {
            code &= !ERROR_CODE_BIT;
        }

        Ok(Response {
            sync,
            code,
            error,
            data,
            buf,
        })
    }

    /// Raw MessagePack bytes of the data payload (empty if absent).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.data.clone()]
    }

    /// Deserialize the data payload.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(rmp_serde::from_slice(self.data())?)
    }

    /// Turn a server-reported failure into an [`Error::Server`].
    pub fn into_result(self) -> Result<Response> {
        match self.error {
            Some(message) => Err(Error::Server {
                code: self.code,
                message,
            }),
            None => Ok(self),
        }
    }
}

fn read_string(rd: &mut &[u8]) -> Result<String> {
    match rmpv::decode::read_value_ref(rd)? {
        rmpv::ValueRef::String(s) => s
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| Error::Protocol("invalid utf-8 in error string".into())),
        other => Err(Error::Protocol(format!(
            "error field is not a string: {other}"
        ))),
    }
}

fn skip_value(rd: &mut &[u8]) -> Result<()> {
    rmpv::decode::read_value_ref(rd)?;
    Ok(())
}
