//! IPROTO wire protocol: constants, framing, request encoding and
//! response decoding.
//!
//! Every unit on the wire is a frame: a 5-byte length-prefixed header
//! followed by two concatenated MessagePack maps (a header map with the
//! request code and sync, then a request- or response-specific body map).

pub mod buffer_pool;
pub mod frame;
pub mod request;
pub mod response;

pub use buffer_pool::{BufferPool, PooledBuf};
pub use frame::{read_frame, FRAME_HEADER_SIZE, FRAME_TAG};
pub use request::Request;
pub use response::Response;

// Request codes.
pub const REQUEST_SELECT: u8 = 0x01;
pub const REQUEST_INSERT: u8 = 0x02;
pub const REQUEST_REPLACE: u8 = 0x03;
pub const REQUEST_UPDATE: u8 = 0x04;
pub const REQUEST_DELETE: u8 = 0x05;
pub const REQUEST_CALL16: u8 = 0x06;
pub const REQUEST_AUTH: u8 = 0x07;
pub const REQUEST_EVAL: u8 = 0x08;
pub const REQUEST_UPSERT: u8 = 0x09;
pub const REQUEST_CALL: u8 = 0x0a;
pub const REQUEST_PING: u8 = 0x40;

// Header and body map keys.
pub const KEY_CODE: u8 = 0x00;
pub const KEY_SYNC: u8 = 0x01;
pub const KEY_SPACE: u8 = 0x10;
pub const KEY_INDEX: u8 = 0x11;
pub const KEY_LIMIT: u8 = 0x12;
pub const KEY_OFFSET: u8 = 0x13;
pub const KEY_ITERATOR: u8 = 0x14;
pub const KEY_KEY: u8 = 0x20;
pub const KEY_TUPLE: u8 = 0x21;
pub const KEY_FUNCTION_NAME: u8 = 0x22;
pub const KEY_USER_NAME: u8 = 0x23;
pub const KEY_EXPRESSION: u8 = 0x27;
pub const KEY_DEF_TUPLE: u8 = 0x28;
pub const KEY_DATA: u8 = 0x30;
pub const KEY_ERROR: u8 = 0x31;

/// Status code of a successful response.
pub const OK_CODE: u32 = 0;

/// High bit set on every non-success status code.
pub const ERROR_CODE_BIT: u32 = 0x8000;

// Server error codes the client special-cases (auth failures).
pub const ER_NO_SUCH_USER: u32 = 45;
pub const ER_PASSWORD_MISMATCH: u32 = 47;

// Iterator types for Select.
pub const ITER_EQ: u32 = 0;
pub const ITER_REQ: u32 = 1;
pub const ITER_ALL: u32 = 2;
pub const ITER_LT: u32 = 3;
pub const ITER_LE: u32 = 4;
pub const ITER_GE: u32 = 5;
pub const ITER_GT: u32 = 6;
pub const ITER_BITS_ALL_SET: u32 = 7;
pub const ITER_BITS_ANY_SET: u32 = 8;
pub const ITER_BITS_ALL_NOT_SET: u32 = 9;
pub const ITER_OVERLAPS: u32 = 10;
pub const ITER_NEIGHBOR: u32 = 11;
