//! Key and value encoding between application data and backend storage.
//!
//! Keys are percent-encoded UTF-8 with `.` additionally escaped, so the stored
//! form only uses `[A-Za-z0-9_~%-]`. That alphabet is safe both as a JSON object
//! member and inside a quoted SQLite JSON path, and the mapping is injective:
//! a literal `%` is itself escaped, so `%2E` in the output can only come from `.`.
//!
//! Values are stored as JSON. A value stored as `None` becomes JSON `null`
//! under a present field, which keeps it distinct from an absent field.

use crate::error::{CellarError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Longest logical key accepted, in UTF-8 bytes.
pub const MAX_KEY_BYTES: usize = 1024;

/// One cached entry as held inside a namespace record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    /// The encoded application value (`null` for a stored `None`).
    pub value: Value,
    /// When the entry was written, in Unix milliseconds.
    pub stored_at: i64,
}

impl StoredEntry {
    /// Wrap a value, stamping it with the current time.
    pub fn new(value: Value) -> Self {
        Self::stored_at(value, Utc::now())
    }

    /// Wrap a value with an explicit write time.
    pub fn stored_at(value: Value, at: DateTime<Utc>) -> Self {
        Self {
            value,
            stored_at: at.timestamp_millis(),
        }
    }

    /// Write time as a timestamp.
    pub fn stored_at_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.stored_at)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Age of the entry relative to `now`. Entries stamped in the future have
    /// zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let millis = now.timestamp_millis().saturating_sub(self.stored_at);
        Duration::from_millis(millis.max(0) as u64)
    }

    /// Whether the entry is older than `expire`. An entry exactly `expire` old
    /// is still fresh.
    pub fn is_expired(&self, expire: Option<Duration>, now: DateTime<Utc>) -> bool {
        match expire {
            Some(limit) => self.age(now) > limit,
            None => false,
        }
    }

    /// Approximate stored size in bytes.
    pub fn size_hint(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Encode a logical key into the backend key alphabet.
pub fn encode_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(CellarError::encoding("cache keys must not be empty"));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(CellarError::encoding(format!(
            "cache key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_BYTES
        )));
    }
    if key.contains('\0') {
        return Err(CellarError::encoding("cache keys must not contain NUL"));
    }

    Ok(urlencoding::encode(key).replace('.', "%2E"))
}

/// Decode a stored key back into its logical form.
pub fn decode_key(encoded: &str) -> Result<String> {
    urlencoding::decode(encoded)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| CellarError::encoding(format!("stored key '{}' is not valid: {}", encoded, e)))
}

/// Encode an application value as JSON.
///
/// JSON has no NaN or infinity and `serde_json` would write them as `null`,
/// so non-finite floats anywhere in the value are rejected instead.
pub fn encode_value<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    value.serialize(finite::FiniteFloats).map_err(|e| {
        CellarError::encoding(format!("value cannot be stored losslessly: {}", e))
    })?;
    serde_json::to_value(value).map_err(|e| {
        CellarError::encoding(format!("value cannot be stored losslessly: {}", e))
    })
}

/// Decode a stored JSON value into an application type.
pub fn decode_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(CellarError::from)
}

/// Serialize an entry for a backend that stores text documents.
pub fn entry_to_json(entry: &StoredEntry) -> Result<String> {
    serde_json::to_string(entry).map_err(|e| CellarError::encoding(e.to_string()))
}

/// Parse an entry read back from a text document.
///
/// Returns `None` for anything that is not a well-formed entry, e.g. a field
/// overwritten out-of-band with some other shape.
pub fn entry_from_json(raw: &str) -> Option<StoredEntry> {
    serde_json::from_str(raw).ok()
}

/// A serializer that discards its input and only fails on non-finite floats.
mod finite {
    use serde::ser::{self, Serialize};
    use std::fmt::Display;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    pub struct NonFinite(String);

    impl ser::Error for NonFinite {
        fn custom<T: Display>(msg: T) -> Self {
            NonFinite(msg.to_string())
        }
    }

    type Result = std::result::Result<(), NonFinite>;

    #[derive(Clone, Copy)]
    pub struct FiniteFloats;

    fn check(value: f64) -> Result {
        if value.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!("{} has no JSON representation", value)))
        }
    }

    impl ser::Serializer for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        type SerializeSeq = Self;
        type SerializeTuple = Self;
        type SerializeTupleStruct = Self;
        type SerializeTupleVariant = Self;
        type SerializeMap = Self;
        type SerializeStruct = Self;
        type SerializeStructVariant = Self;

        fn serialize_bool(self, _v: bool) -> Result {
            Ok(())
        }
        fn serialize_i8(self, _v: i8) -> Result {
            Ok(())
        }
        fn serialize_i16(self, _v: i16) -> Result {
            Ok(())
        }
        fn serialize_i32(self, _v: i32) -> Result {
            Ok(())
        }
        fn serialize_i64(self, _v: i64) -> Result {
            Ok(())
        }
        fn serialize_i128(self, _v: i128) -> Result {
            Ok(())
        }
        fn serialize_u8(self, _v: u8) -> Result {
            Ok(())
        }
        fn serialize_u16(self, _v: u16) -> Result {
            Ok(())
        }
        fn serialize_u32(self, _v: u32) -> Result {
            Ok(())
        }
        fn serialize_u64(self, _v: u64) -> Result {
            Ok(())
        }
        fn serialize_u128(self, _v: u128) -> Result {
            Ok(())
        }
        fn serialize_f32(self, v: f32) -> Result {
            check(f64::from(v))
        }
        fn serialize_f64(self, v: f64) -> Result {
            check(v)
        }
        fn serialize_char(self, _v: char) -> Result {
            Ok(())
        }
        fn serialize_str(self, _v: &str) -> Result {
            Ok(())
        }
        fn serialize_bytes(self, _v: &[u8]) -> Result {
            Ok(())
        }
        fn serialize_none(self) -> Result {
            Ok(())
        }
        fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result {
            value.serialize(self)
        }
        fn serialize_unit(self) -> Result {
            Ok(())
        }
        fn serialize_unit_struct(self, _name: &'static str) -> Result {
            Ok(())
        }
        fn serialize_unit_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
        ) -> Result {
            Ok(())
        }
        fn serialize_newtype_struct<T: ?Sized + Serialize>(
            self,
            _name: &'static str,
            value: &T,
        ) -> Result {
            value.serialize(self)
        }
        fn serialize_newtype_variant<T: ?Sized + Serialize>(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            value: &T,
        ) -> Result {
            value.serialize(self)
        }
        fn serialize_seq(self, _len: Option<usize>) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_tuple(self, _len: usize) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_tuple_struct(
            self,
            _name: &'static str,
            _len: usize,
        ) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_tuple_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_map(self, _len: Option<usize>) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_struct(
            self,
            _name: &'static str,
            _len: usize,
        ) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
        fn serialize_struct_variant(
            self,
            _name: &'static str,
            _index: u32,
            _variant: &'static str,
            _len: usize,
        ) -> std::result::Result<Self, NonFinite> {
            Ok(self)
        }
    }

    impl ser::SerializeSeq for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeTuple for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeTupleStruct for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeTupleVariant for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeMap for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result {
            key.serialize(*self)
        }
        fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeStruct for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(
            &mut self,
            _key: &'static str,
            value: &T,
        ) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }

    impl ser::SerializeStructVariant for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(
            &mut self,
            _key: &'static str,
            value: &T,
        ) -> Result {
            value.serialize(*self)
        }
        fn end(self) -> Result {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_encoding_roundtrips_unicode_and_spaces() {
        for key in ["hiŏ", "hi ŏ", "has space", "hasspace", "a.b", "100%", "x/y?z"] {
            let encoded = encode_key(key).unwrap();
            assert!(encoded
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_~%-".contains(c)));
            assert_eq!(decode_key(&encoded).unwrap(), key);
        }
    }

    #[test]
    fn test_key_encoding_is_injective_for_lookalikes() {
        let pairs = [
            ("has space", "hasspace"),
            ("hi ŏ", "hiŏ"),
            ("a.b", "a%2Eb"),
            ("hŏa", "hiŏ"),
        ];
        for (a, b) in pairs {
            assert_ne!(encode_key(a).unwrap(), encode_key(b).unwrap(), "{a} vs {b}");
        }
    }

    #[test]
    fn test_invalid_keys_are_rejected() {
        assert!(encode_key("").is_err());
        assert!(encode_key("nul\0byte").is_err());
        assert!(encode_key(&"k".repeat(MAX_KEY_BYTES + 1)).is_err());
        assert!(encode_key(&"k".repeat(MAX_KEY_BYTES)).is_ok());
    }

    #[test]
    fn test_none_is_stored_as_null() {
        let none: Option<i32> = None;
        let encoded = encode_value(&none).unwrap();
        assert_eq!(encoded, Value::Null);

        let decoded: Option<i32> = decode_value(encoded).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn test_non_finite_floats_are_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = encode_value(&value).unwrap_err();
            assert!(matches!(err, CellarError::Encoding { .. }), "{value}");
        }

        let nested = json!({"ok": [1.5, 2.0]});
        assert_eq!(encode_value(&nested).unwrap(), nested);
        assert!(encode_value(&vec![Some(1.0_f32), Some(f32::NAN)]).is_err());
        assert!(encode_value(&std::collections::HashMap::from([("k", f64::INFINITY)])).is_err());
        assert_eq!(encode_value(&-0.0_f64).unwrap(), json!(-0.0));
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = StoredEntry {
            value: json!({"n": 1}),
            stored_at: 1_700_000_000_000,
        };
        let raw = entry_to_json(&entry).unwrap();
        assert_eq!(raw, r#"{"value":{"n":1},"stored_at":1700000000000}"#);
        assert_eq!(entry_from_json(&raw), Some(entry));
        assert_eq!(entry_from_json("42"), None);
        assert_eq!(entry_from_json(r#"{"value": 1}"#), None);
    }

    #[test]
    fn test_expiration_boundary() {
        let now = Utc::now();
        let entry = StoredEntry::stored_at(json!(1), now - chrono::Duration::seconds(10));
        assert!(!entry.is_expired(None, now));
        assert!(!entry.is_expired(Some(Duration::from_secs(10)), now));
        assert!(entry.is_expired(Some(Duration::from_secs(9)), now));

        let future = StoredEntry::stored_at(json!(1), now + chrono::Duration::seconds(5));
        assert_eq!(future.age(now), Duration::ZERO);
    }
}
