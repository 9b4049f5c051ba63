//! Purpose: Per-field value transforms applied around storage I/O.
//! Exports: `Serializer`, `Identity`, `CompressedStr`, `by_name`.
//! Role: Pluggable seam between in-memory record values and stored column values.
//! Invariants: `deserialize(serialize(x)) == x` for every value `serialize` accepts.
//! Invariants: `Value::Null` passes through the built-in serializers untouched.
use std::fmt;
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::value::Value;

const ZSTD_LEVEL: i32 = 3;

pub trait Serializer: fmt::Debug + Send + Sync {
    /// Registry name; used when a schema is declared as JSON.
    fn name(&self) -> &'static str;

    fn serialize(&self, value: &Value) -> Result<Value, Error>;

    fn deserialize(&self, stored: Value) -> Result<Value, Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Identity;

impl Serializer for Identity {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn serialize(&self, value: &Value) -> Result<Value, Error> {
        Ok(value.clone())
    }

    fn deserialize(&self, stored: Value) -> Result<Value, Error> {
        Ok(stored)
    }
}

/// Stores text as a zstd-compressed blob and inflates it on read.
#[derive(Clone, Copy, Debug, Default)]
pub struct CompressedStr;

impl Serializer for CompressedStr {
    fn name(&self) -> &'static str {
        "compressed_str"
    }

    fn serialize(&self, value: &Value) -> Result<Value, Error> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Text(text) => zstd::encode_all(text.as_bytes(), ZSTD_LEVEL)
                .map(Value::Blob)
                .map_err(|err| {
                    Error::new(ErrorKind::Serialization)
                        .with_message("failed to compress text")
                        .with_source(err)
                }),
            other => Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "compressed_str expects text, got {}",
                other.type_name()
            ))),
        }
    }

    fn deserialize(&self, stored: Value) -> Result<Value, Error> {
        match stored {
            Value::Null => Ok(Value::Null),
            Value::Blob(bytes) => {
                let raw = zstd::decode_all(bytes.as_slice()).map_err(|err| {
                    Error::new(ErrorKind::Serialization)
                        .with_message("stored value is not zstd data")
                        .with_source(err)
                })?;
                String::from_utf8(raw).map(Value::Text).map_err(|err| {
                    Error::new(ErrorKind::Serialization)
                        .with_message("decompressed value is not UTF-8")
                        .with_source(err)
                })
            }
            other => Err(Error::new(ErrorKind::Serialization).with_message(format!(
                "compressed_str expects a stored blob, got {}",
                other.type_name()
            ))),
        }
    }
}

pub fn identity() -> Arc<dyn Serializer> {
    Arc::new(Identity)
}

pub fn by_name(name: &str) -> Result<Arc<dyn Serializer>, Error> {
    match name {
        "identity" => Ok(Arc::new(Identity)),
        "compressed_str" => Ok(Arc::new(CompressedStr)),
        other => Err(Error::new(ErrorKind::Schema)
            .with_message(format!("unknown serializer `{other}`"))
            .with_hint("Known serializers: identity, compressed_str")),
    }
}

#[cfg(test)]
mod tests {
    use super::{CompressedStr, Identity, Serializer, by_name};
    use crate::core::error::ErrorKind;
    use crate::core::value::Value;

    #[test]
    fn identity_passes_values_through() {
        let value = Value::Integer(7);
        let stored = Identity.serialize(&value).unwrap();
        assert_eq!(stored, value);
        assert_eq!(Identity.deserialize(stored).unwrap(), value);
    }

    #[test]
    fn compressed_str_round_trips_text() {
        let text = Value::Text("product description ".repeat(40));
        let stored = CompressedStr.serialize(&text).unwrap();
        let Value::Blob(bytes) = &stored else {
            panic!("expected blob, got {stored:?}");
        };
        assert!(bytes.len() < 800);
        assert_eq!(CompressedStr.deserialize(stored).unwrap(), text);
    }

    #[test]
    fn compressed_str_keeps_null() {
        assert_eq!(CompressedStr.serialize(&Value::Null).unwrap(), Value::Null);
        assert_eq!(CompressedStr.deserialize(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn compressed_str_rejects_non_text_and_corrupt_blobs() {
        let err = CompressedStr.serialize(&Value::Integer(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);

        let err = CompressedStr
            .deserialize(Value::Blob(b"not zstd".to_vec()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn registry_resolves_known_names() {
        assert_eq!(by_name("compressed_str").unwrap().name(), "compressed_str");
        assert_eq!(by_name("identity").unwrap().name(), "identity");
        assert_eq!(by_name("gzip").unwrap_err().kind(), ErrorKind::Schema);
    }
}
