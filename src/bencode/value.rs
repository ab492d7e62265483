//! Bencode value tree
//!
//! Closed variant type for decoded bencode data, with typed accessors.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::error::TorrentError;

/// Dictionary representation; `BTreeMap` keeps keys in byte-lexicographic order
pub type BencodeDict = BTreeMap<Vec<u8>, BencodeValue>;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    /// Raw bytes, not assumed to be text
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BencodeDict),
}

impl BencodeValue {
    /// Byte string value from text
    pub fn string(s: &str) -> Self {
        BencodeValue::Bytes(s.as_bytes().to_vec())
    }

    /// Build a dictionary from `(key, value)` pairs in any order
    pub fn dict<K: AsRef<[u8]>>(entries: impl IntoIterator<Item = (K, BencodeValue)>) -> Self {
        BencodeValue::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_vec(), v))
                .collect(),
        )
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8 text, if it is valid
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BencodeDict> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Short type name used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            BencodeValue::Integer(_) => "integer",
            BencodeValue::Bytes(_) => "byte string",
            BencodeValue::List(_) => "list",
            BencodeValue::Dict(_) => "dictionary",
        }
    }

    /// Look up a key; `None` when the key is absent or `self` is not a dictionary
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// Look up a required key, failing with `MissingField`
    pub fn require(&self, key: &str) -> Result<&BencodeValue> {
        self.get(key)
            .ok_or_else(|| TorrentError::missing_field(key).into())
    }

    /// Required byte string field
    pub fn require_bytes(&self, key: &str) -> Result<&[u8]> {
        let value = self.require(key)?;
        value
            .as_bytes()
            .ok_or_else(|| wrong_type(key, "byte string", value).into())
    }

    /// Required integer field
    pub fn require_integer(&self, key: &str) -> Result<i64> {
        let value = self.require(key)?;
        value
            .as_integer()
            .ok_or_else(|| wrong_type(key, "integer", value).into())
    }

    /// Required dictionary field, returned as a value so lookups can chain
    pub fn require_dict(&self, key: &str) -> Result<&BencodeValue> {
        let value = self.require(key)?;
        match value {
            BencodeValue::Dict(_) => Ok(value),
            other => Err(wrong_type(key, "dictionary", other).into()),
        }
    }

    /// Render as JSON; byte strings become UTF-8 text when valid, lowercase hex otherwise
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            BencodeValue::Integer(i) => serde_json::Value::from(*i),
            BencodeValue::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => serde_json::Value::String(hex::encode(b)),
            },
            BencodeValue::List(items) => {
                serde_json::Value::Array(items.iter().map(BencodeValue::to_json).collect())
            }
            BencodeValue::Dict(dict) => serde_json::Value::Object(
                dict.iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

fn wrong_type(key: &str, expected: &str, found: &BencodeValue) -> TorrentError {
    TorrentError::invalid_field(key, format!("expected {}, found {}", expected, found.type_name()))
}

impl From<i64> for BencodeValue {
    fn from(i: i64) -> Self {
        BencodeValue::Integer(i)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::string(s)
    }
}

impl From<Vec<u8>> for BencodeValue {
    fn from(b: Vec<u8>) -> Self {
        BencodeValue::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kind_of(err: &anyhow::Error) -> ErrorKind {
        err.downcast_ref::<TorrentError>().unwrap().kind()
    }

    #[test]
    fn test_accessors() {
        assert_eq!(BencodeValue::Integer(-3).as_integer(), Some(-3));
        assert_eq!(BencodeValue::string("spam").as_str(), Some("spam"));
        assert_eq!(BencodeValue::Bytes(vec![0xff, 0xfe]).as_str(), None);
        assert!(BencodeValue::List(vec![]).as_list().is_some());
        assert!(BencodeValue::Integer(1).as_dict().is_none());
    }

    #[test]
    fn test_require_helpers() {
        let value = BencodeValue::dict([
            ("length", BencodeValue::Integer(10)),
            ("name", BencodeValue::string("a.txt")),
        ]);

        assert_eq!(value.require_integer("length").unwrap(), 10);
        assert_eq!(value.require_bytes("name").unwrap(), b"a.txt");

        let err = value.require_integer("pieces").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::MissingField);

        let err = value.require_integer("name").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidField);

        let err = value.require_dict("length").unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidField);
    }

    #[test]
    fn test_get_on_non_dict() {
        assert!(BencodeValue::Integer(5).get("x").is_none());
    }

    #[test]
    fn test_to_json() {
        let value = BencodeValue::dict([
            ("b", BencodeValue::List(vec![BencodeValue::Integer(1), BencodeValue::string("x")])),
            ("a", BencodeValue::Bytes(vec![0x00, 0xff])),
        ]);
        let json = value.to_json();
        assert_eq!(json["a"], "00ff");
        assert_eq!(json["b"][0], 1);
        assert_eq!(json["b"][1], "x");
    }
}
