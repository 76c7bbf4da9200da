//! Request variants and their wire encoding.
//!
//! Each variant encodes to a fixed map shape mirroring the server's
//! command set. Key and tuple fields arrive here already serialized to
//! raw MessagePack (see [`crate::tuple`]); this module only splices them
//! into the body map.

use rmp::encode::{write_array_len, write_map_len, write_str, write_str_len, write_uint};

use crate::error::Result;
use crate::protocol::{self, frame};

/// Authentication mechanism named in the auth request body.
pub const AUTH_MECHANISM: &str = "chap-sha1";

/// One request to the server, tagged by kind.
#[derive(Debug, Clone)]
pub enum Request {
    Auth {
        user: String,
        scramble: Vec<u8>,
    },
    Ping,
    Select {
        space: u32,
        index: u32,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: Vec<u8>,
    },
    Insert {
        space: u32,
        tuple: Vec<u8>,
    },
    Replace {
        space: u32,
        tuple: Vec<u8>,
    },
    Delete {
        space: u32,
        index: u32,
        key: Vec<u8>,
    },
    Update {
        space: u32,
        index: u32,
        key: Vec<u8>,
        ops: Vec<u8>,
    },
    Upsert {
        space: u32,
        key: Vec<u8>,
        ops: Vec<u8>,
    },
    Call {
        function: String,
        args: Vec<u8>,
    },
    Call17 {
        function: String,
        args: Vec<u8>,
    },
    Eval {
        expression: String,
        args: Vec<u8>,
    },
}

impl Request {
    /// Wire code of this request kind.
    pub fn code(&self) -> u8 {
        match self {
            Request::Auth { .. } => protocol::REQUEST_AUTH,
            Request::Ping => protocol::REQUEST_PING,
            Request::Select { .. } => protocol::REQUEST_SELECT,
            Request::Insert { .. } => protocol::REQUEST_INSERT,
            Request::Replace { .. } => protocol::REQUEST_REPLACE,
            Request::Delete { .. } => protocol::REQUEST_DELETE,
            Request::Update { .. } => protocol::REQUEST_UPDATE,
            Request::Upsert { .. } => protocol::REQUEST_UPSERT,
            Request::Call { .. } => protocol::REQUEST_CALL16,
            Request::Call17 { .. } => protocol::REQUEST_CALL,
            Request::Eval { .. } => protocol::REQUEST_EVAL,
        }
    }

    /// Encode the complete wire frame for this request.
    ///
    /// Layout: `0xCE` + big-endian u32 body length, then the header map
    /// `{code, sync}` (sync always as a full uint32 so the slot width is
    /// stable), then the variant-specific body map. The length prefix is
    /// back-patched once the body size is known, so the frame is built in
    /// a single buffer without a separate size pass.
    pub fn encode_frame(&self, sync: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64 + self.raw_len());
        buf.extend_from_slice(&[0u8; frame::FRAME_HEADER_SIZE]);

        // Header map {KEY_CODE: code, KEY_SYNC: sync}. Keys and the
        // request code fit in positive fixints.
        buf.push(0x82);
        buf.push(protocol::KEY_CODE);
        buf.push(self.code());
        buf.push(protocol::KEY_SYNC);
        buf.push(0xce);
        buf.extend_from_slice(&sync.to_be_bytes());

        self.encode_body(&mut buf)?;

        let body_len = (buf.len() - frame::FRAME_HEADER_SIZE) as u32;
        let header = frame::encode_header(body_len);
        buf[..frame::FRAME_HEADER_SIZE].copy_from_slice(&header);

        Ok(buf)
    }

    fn encode_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Request::Auth { user, scramble } => {
                write_map_len(buf, 2)?;
                write_uint(buf, protocol::KEY_USER_NAME as u64)?;
                write_str(buf, user)?;
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                write_array_len(buf, 2)?;
                write_str(buf, AUTH_MECHANISM)?;
                // The scramble goes on the wire as a msgpack str, not bin.
                write_str_len(buf, scramble.len() as u32)?;
                buf.extend_from_slice(scramble);
            }
            Request::Ping => {
                write_map_len(buf, 0)?;
            }
            Request::Select {
                space,
                index,
                offset,
                limit,
                iterator,
                key,
            } => {
                write_map_len(buf, 6)?;
                write_uint(buf, protocol::KEY_ITERATOR as u64)?;
                write_uint(buf, *iterator as u64)?;
                write_uint(buf, protocol::KEY_OFFSET as u64)?;
                write_uint(buf, *offset as u64)?;
                write_uint(buf, protocol::KEY_LIMIT as u64)?;
                write_uint(buf, *limit as u64)?;
                write_uint(buf, protocol::KEY_SPACE as u64)?;
                write_uint(buf, *space as u64)?;
                write_uint(buf, protocol::KEY_INDEX as u64)?;
                write_uint(buf, *index as u64)?;
                write_uint(buf, protocol::KEY_KEY as u64)?;
                buf.extend_from_slice(key);
            }
            Request::Insert { space, tuple } | Request::Replace { space, tuple } => {
                write_map_len(buf, 2)?;
                write_uint(buf, protocol::KEY_SPACE as u64)?;
                write_uint(buf, *space as u64)?;
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                buf.extend_from_slice(tuple);
            }
            Request::Delete { space, index, key } => {
                write_map_len(buf, 3)?;
                write_uint(buf, protocol::KEY_SPACE as u64)?;
                write_uint(buf, *space as u64)?;
                write_uint(buf, protocol::KEY_INDEX as u64)?;
                write_uint(buf, *index as u64)?;
                write_uint(buf, protocol::KEY_KEY as u64)?;
                buf.extend_from_slice(key);
            }
            Request::Update {
                space,
                index,
                key,
                ops,
            } => {
                write_map_len(buf, 4)?;
                write_uint(buf, protocol::KEY_SPACE as u64)?;
                write_uint(buf, *space as u64)?;
                write_uint(buf, protocol::KEY_INDEX as u64)?;
                write_uint(buf, *index as u64)?;
                write_uint(buf, protocol::KEY_KEY as u64)?;
                buf.extend_from_slice(key);
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                buf.extend_from_slice(ops);
            }
            Request::Upsert { space, key, ops } => {
                write_map_len(buf, 3)?;
                write_uint(buf, protocol::KEY_SPACE as u64)?;
                write_uint(buf, *space as u64)?;
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                buf.extend_from_slice(key);
                write_uint(buf, protocol::KEY_DEF_TUPLE as u64)?;
                buf.extend_from_slice(ops);
            }
            Request::Call { function, args } | Request::Call17 { function, args } => {
                write_map_len(buf, 2)?;
                write_uint(buf, protocol::KEY_FUNCTION_NAME as u64)?;
                write_str(buf, function)?;
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                buf.extend_from_slice(args);
            }
            Request::Eval { expression, args } => {
                write_map_len(buf, 2)?;
                write_uint(buf, protocol::KEY_EXPRESSION as u64)?;
                write_str(buf, expression)?;
                write_uint(buf, protocol::KEY_TUPLE as u64)?;
                buf.extend_from_slice(args);
            }
        }

        Ok(())
    }

    /// Combined length of the raw pre-encoded fields, for the initial
    /// buffer reservation.
    fn raw_len(&self) -> usize {
        match self {
            Request::Auth { scramble, .. } => scramble.len(),
            Request::Ping => 0,
            Request::Select { key, .. } => key.len(),
            Request::Insert { tuple, .. } | Request::Replace { tuple, .. } => tuple.len(),
            Request::Delete { key, .. } => key.len(),
            Request::Update { key, ops, .. } | Request::Upsert { key, ops, .. } => {
                key.len() + ops.len()
            }
            Request::Call { args, .. }
            | Request::Call17 { args, .. }
            | Request::Eval { args, .. } => args.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::encode_tuple;

    #[test]
    fn test_ping_frame_golden_bytes() {
        let frame = Request::Ping.encode_frame(5).unwrap();
        assert_eq!(
            frame,
            vec![
                0xce, 0x00, 0x00, 0x00, 0x0a, // tag + body length 10
                0x82, 0x00, 0x40, // header map, code = ping
                0x01, 0xce, 0x00, 0x00, 0x00, 0x05, // sync = 5 as uint32
                0x80, // empty body map
            ]
        );
    }

    #[test]
    fn test_length_prefix_matches_body() {
        let key = encode_tuple(&(42u32,)).unwrap();
        let frame = Request::Select {
            space: 512,
            index: 0,
            offset: 0,
            limit: 100,
            iterator: protocol::ITER_EQ,
            key,
        }
        .encode_frame(7)
        .unwrap();

        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        assert_eq!(frame[0], frame::FRAME_TAG);
        assert_eq!(len, frame.len() - frame::FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_select_body_shape() {
        let key = encode_tuple(&(1u32,)).unwrap();
        let frame = Request::Select {
            space: 10,
            index: 2,
            offset: 3,
            limit: 4,
            iterator: protocol::ITER_GE,
            key,
        }
        .encode_frame(1)
        .unwrap();

        // Skip frame header (5) and request header map (9).
        let mut body = &frame[14..];
        let value = rmpv::decode::read_value(&mut body).unwrap();
        let map = value.as_map().expect("body must be a map");

        assert_eq!(map.len(), 6);
        let get = |key: u8| {
            map.iter()
                .find(|(k, _)| k.as_u64() == Some(key as u64))
                .map(|(_, v)| v)
                .expect("missing key")
        };
        assert_eq!(get(protocol::KEY_ITERATOR).as_u64(), Some(5));
        assert_eq!(get(protocol::KEY_OFFSET).as_u64(), Some(3));
        assert_eq!(get(protocol::KEY_LIMIT).as_u64(), Some(4));
        assert_eq!(get(protocol::KEY_SPACE).as_u64(), Some(10));
        assert_eq!(get(protocol::KEY_INDEX).as_u64(), Some(2));
        assert!(get(protocol::KEY_KEY).is_array());
    }

    #[test]
    fn test_auth_scramble_encoded_as_str() {
        let frame = Request::Auth {
            user: "guest".into(),
            scramble: vec![0xAA; 20],
        }
        .encode_frame(0)
        .unwrap();

        let mut body = &frame[14..];
        let value = rmpv::decode::read_value(&mut body).unwrap();
        let map = value.as_map().unwrap();

        let tuple = map
            .iter()
            .find(|(k, _)| k.as_u64() == Some(protocol::KEY_TUPLE as u64))
            .map(|(_, v)| v)
            .unwrap();
        let parts = tuple.as_array().unwrap();
        assert_eq!(parts[0].as_str(), Some(AUTH_MECHANISM));
        // str, not bin: as_str succeeds even though the payload is raw bytes.
        assert!(matches!(parts[1], rmpv::Value::String(_)));
    }

    #[test]
    fn test_upsert_uses_def_tuple_key() {
        let key = encode_tuple(&(1u32,)).unwrap();
        let ops = encode_tuple(&[("+", 1u32, 1u32)]).unwrap();
        let frame = Request::Upsert {
            space: 9,
            key,
            ops,
        }
        .encode_frame(3)
        .unwrap();

        let mut body = &frame[14..];
        let value = rmpv::decode::read_value(&mut body).unwrap();
        let map = value.as_map().unwrap();
        let keys: Vec<u64> = map.iter().filter_map(|(k, _)| k.as_u64()).collect();
        assert_eq!(
            keys,
            vec![
                protocol::KEY_SPACE as u64,
                protocol::KEY_TUPLE as u64,
                protocol::KEY_DEF_TUPLE as u64,
            ]
        );
    }
}
