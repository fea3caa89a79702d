//! Per-field wire codecs.
//!
//! Every synchronized field carries a codec translating between its local
//! representation and the string form stored in the shared backend. Complex
//! types supply their own codec; this is a pluggable strategy per field, not
//! a type hierarchy.

use std::fmt::Display;
use std::marker::PhantomData;
use std::str::FromStr;

/// Local/wire translation strategy for one field type.
pub trait FieldCodec<T>: Send + Sync {
    /// Encodes a local value to its wire form.
    fn encode(&self, value: &T) -> String;

    /// Decodes a wire form back to a local value.
    ///
    /// Returns `None` for malformed payloads; the field then falls back to
    /// its local value and the caller logs the corruption.
    fn decode(&self, wire: &str) -> Option<T>;

    /// Whether a local value is worth pushing during warm-up `sync()`.
    ///
    /// Collection-like fields override this so empty collections are not
    /// published.
    fn has_data(&self, _value: &T) -> bool {
        true
    }
}

/// Codec for any type whose wire form is its `Display`/`FromStr` pair
/// (integers, booleans).
pub struct ScalarCodec<T>(PhantomData<fn() -> T>);

impl<T> ScalarCodec<T> {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for ScalarCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FieldCodec<T> for ScalarCodec<T>
where
    T: Display + FromStr + Send + Sync,
{
    fn encode(&self, value: &T) -> String {
        value.to_string()
    }

    fn decode(&self, wire: &str) -> Option<T> {
        wire.parse().ok()
    }
}

/// Codec for plain string fields.
pub struct StringCodec;

impl FieldCodec<String> for StringCodec {
    fn encode(&self, value: &String) -> String {
        value.clone()
    }

    fn decode(&self, wire: &str) -> Option<String> {
        Some(wire.to_owned())
    }
}

/// Codec for tag-style string lists, comma-joined on the wire.
///
/// Tag names cannot contain commas; the separator is safe. An empty list is
/// "no data" for warm-up purposes, matching the shared side where an absent
/// hash field means no tags.
pub struct TagListCodec;

impl FieldCodec<Vec<String>> for TagListCodec {
    fn encode(&self, value: &Vec<String>) -> String {
        value.join(",")
    }

    fn decode(&self, wire: &str) -> Option<Vec<String>> {
        if wire.is_empty() {
            return Some(Vec::new());
        }
        Some(wire.split(',').map(str::to_owned).collect())
    }

    fn has_data(&self, value: &Vec<String>) -> bool {
        !value.is_empty()
    }
}
