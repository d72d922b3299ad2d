//! Serde helpers for event payloads.
//!
//! When the `tracing` feature is enabled, payload decoding also reports fields the
//! expense types do not capture and the path of the field that failed to decode.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// A `serde_as` type that deserializes strings or integers as `String`.
///
/// Expense identifiers arrive as either `"42"` or `42` depending on the producer.
/// Use with `#[serde(with = "serde_with::As::<StringFromAny>")]`, or the `Option<StringFromAny>` form.
pub struct StringFromAny;

impl<'de> serde_with::DeserializeAs<'de, String> for StringFromAny {
    fn deserialize_as<D>(deserializer: D) -> std::result::Result<String, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct StringOrNumberVisitor;

        impl Visitor<'_> for StringOrNumberVisitor {
            type Value = String;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("string or integer")
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_owned())
            }

            fn visit_string<E>(self, v: String) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v)
            }

            fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }

            fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(v.to_string())
            }
        }

        deserializer.deserialize_any(StringOrNumberVisitor)
    }
}

impl serde_with::SerializeAs<String> for StringFromAny {
    fn serialize_as<S>(source: &String, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(source)
    }
}

/// Decode a payload, reporting unknown fields and the failing field path.
///
/// Unknown fields never fail decoding. On failure the returned message names the
/// offending field, e.g. `amount: invalid type: map, expected a Decimal`.
#[cfg(feature = "tracing")]
pub fn decode_payload<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    use std::any::type_name;

    let mut unknown_paths: Vec<String> = Vec::new();
    let mut track = serde_path_to_error::Track::new();

    let decoded: Result<T, _> = serde_ignored::deserialize(
        serde_path_to_error::Deserializer::new(value, &mut track),
        |path| unknown_paths.push(path.to_string()),
    );

    match decoded {
        Ok(decoded) => {
            for path in unknown_paths {
                tracing::debug!(
                    type_name = %type_name::<T>(),
                    field = %path,
                    "unknown field in event payload"
                );
            }
            Ok(decoded)
        }
        Err(e) => {
            let path = track.path().to_string();
            tracing::debug!(
                type_name = %type_name::<T>(),
                path = %path,
                error = %e,
                "event payload failed to decode"
            );
            Err(format!("{path}: {e}"))
        }
    }
}

/// Pass-through decoding when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub fn decode_payload<T: DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value(value).map_err(|e| e.to_string())
}
