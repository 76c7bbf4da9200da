//! Key and tuple helpers for request bodies.
//!
//! The client never inspects key or tuple structure: anything
//! `serde::Serialize` is encoded to raw MessagePack once, up front, and
//! spliced into the body map verbatim. Keys and tuples are
//! conventionally arrays, so the helpers here all serialize as
//! sequences.

use serde::ser::{Serialize, SerializeSeq, Serializer};

use crate::error::Result;

/// Serialize a key/tuple value to raw MessagePack (positional layout:
/// structs and tuples become arrays).
pub fn encode_tuple<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmp_serde::encode::write(&mut buf, value)?;
    Ok(buf)
}

/// Empty key: serializes as a zero-element array, selecting everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyKey;

impl Serialize for EmptyKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_seq(Some(0))?.end()
    }
}

/// Single signed-integer key; serializes as `[i]`.
#[derive(Debug, Clone, Copy)]
pub struct IntKey(pub i64);

impl Serialize for IntKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1))?;
        seq.serialize_element(&self.0)?;
        seq.end()
    }
}

/// Single unsigned-integer key; serializes as `[i]`.
#[derive(Debug, Clone, Copy)]
pub struct UintKey(pub u64);

impl Serialize for UintKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1))?;
        seq.serialize_element(&self.0)?;
        seq.end()
    }
}

/// Single string key; serializes as `[s]`.
#[derive(Debug, Clone)]
pub struct StringKey(pub String);

impl Serialize for StringKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(1))?;
        seq.serialize_element(&self.0)?;
        seq.end()
    }
}

/// One update operation: `[op, field, arg]`.
///
/// `op` is the server's operation symbol (`"+"`, `"-"`, `"="`, `"!"`,
/// `"#"`, …).
#[derive(Debug, Clone)]
pub struct Op<T> {
    pub op: &'static str,
    pub field: i64,
    pub arg: T,
}

impl<T: Serialize> Serialize for Op<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(self.op)?;
        seq.serialize_element(&self.field)?;
        seq.serialize_element(&self.arg)?;
        seq.end()
    }
}

/// Splice update operation: `[":", field, pos, len, replacement]`.
#[derive(Debug, Clone)]
pub struct OpSplice {
    pub field: i64,
    pub pos: i64,
    pub len: i64,
    pub replace: String,
}

impl Serialize for OpSplice {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(5))?;
        seq.serialize_element(":")?;
        seq.serialize_element(&self.field)?;
        seq.serialize_element(&self.pos)?;
        seq.serialize_element(&self.len)?;
        seq.serialize_element(&self.replace)?;
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_key_is_empty_array() {
        assert_eq!(encode_tuple(&EmptyKey).unwrap(), vec![0x90]);
    }

    #[test]
    fn test_int_key_single_element_array() {
        assert_eq!(encode_tuple(&IntKey(7)).unwrap(), vec![0x91, 0x07]);
        assert_eq!(encode_tuple(&UintKey(7)).unwrap(), vec![0x91, 0x07]);
    }

    #[test]
    fn test_string_key() {
        let encoded = encode_tuple(&StringKey("ab".into())).unwrap();
        assert_eq!(encoded, vec![0x91, 0xa2, b'a', b'b']);
    }

    #[test]
    fn test_op_layout() {
        let op = Op {
            op: "+",
            field: 1,
            arg: 10u32,
        };
        let encoded = encode_tuple(&op).unwrap();
        assert_eq!(encoded, vec![0x93, 0xa1, b'+', 0x01, 0x0a]);
    }

    #[test]
    fn test_splice_layout() {
        let op = OpSplice {
            field: 2,
            pos: 0,
            len: 3,
            replace: "xy".into(),
        };
        let encoded = encode_tuple(&op).unwrap();
        assert_eq!(
            encoded,
            vec![0x95, 0xa1, b':', 0x02, 0x00, 0x03, 0xa2, b'x', b'y']
        );
    }

    #[test]
    fn test_plain_tuples_serialize_positionally() {
        let encoded = encode_tuple(&(1u32, "a")).unwrap();
        assert_eq!(encoded, vec![0x92, 0x01, 0xa1, b'a']);
    }
}
