//! Bencode codec
//!
//! Byte-exact decoding and canonical encoding of BitTorrent's serialization format.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_at, MAX_DEPTH};
pub use encode::encode;
pub use value::{BencodeDict, BencodeValue};
