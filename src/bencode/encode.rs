//! Bencode encoder
//!
//! Emits the canonical encoding: dictionary keys in ascending byte order.

use bytes::{BufMut, BytesMut};

use crate::bencode::value::BencodeValue;

/// Encode a value to its canonical byte representation
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.to_vec()
}

fn encode_into(value: &BencodeValue, buf: &mut BytesMut) {
    match value {
        BencodeValue::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        BencodeValue::Bytes(bytes) => put_bytes(bytes, buf),
        BencodeValue::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        BencodeValue::Dict(dict) => {
            // Sorted here rather than trusting the map's iteration order
            let mut entries: Vec<_> = dict.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            buf.put_u8(b'd');
            for (key, value) in entries {
                put_bytes(key, buf);
                encode_into(value, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn put_bytes(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}
