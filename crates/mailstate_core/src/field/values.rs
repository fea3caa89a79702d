//! Complex field value types and their wire codecs.
//!
//! These carry no mail business rules; they exist so item state can
//! synchronize the original's complex attributes (color, ACL, retention
//! policy) with their own compact encodings. Malformed wire payloads decode
//! to `None` and the field falls back to its local/default value.

use crate::field::codec::FieldCodec;

/// An item display color, stored on the wire as one integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color(pub u32);

impl Color {
    /// The unset color.
    pub const NONE: Color = Color(0);

    /// Creates a color from an RGB triple.
    #[must_use]
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self(((r as u32) << 16) | ((g as u32) << 8) | (b as u32))
    }
}

/// Wire codec for [`Color`].
pub struct ColorCodec;

impl FieldCodec<Color> for ColorCodec {
    fn encode(&self, value: &Color) -> String {
        value.0.to_string()
    }

    fn decode(&self, wire: &str) -> Option<Color> {
        wire.parse().ok().map(Color)
    }
}

/// One access grant on an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Who the grant applies to (an opaque principal id).
    pub grantee: String,
    /// Granted rights bitmask.
    pub rights: u32,
}

/// An item access-control list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    /// The grants, in application order.
    pub grants: Vec<Grant>,
}

impl Acl {
    /// An ACL with no grants.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if no grants are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}

/// Wire codec for [`Acl`].
///
/// Encoding: `grantee:rights` pairs joined by `;`. Grantee ids cannot
/// contain `:` or `;`.
pub struct AclCodec;

impl FieldCodec<Acl> for AclCodec {
    fn encode(&self, value: &Acl) -> String {
        value
            .grants
            .iter()
            .map(|g| format!("{}:{}", g.grantee, g.rights))
            .collect::<Vec<_>>()
            .join(";")
    }

    fn decode(&self, wire: &str) -> Option<Acl> {
        if wire.is_empty() {
            return Some(Acl::empty());
        }
        let mut grants = Vec::new();
        for pair in wire.split(';') {
            let (grantee, rights) = pair.split_once(':')?;
            if grantee.is_empty() {
                return None;
            }
            grants.push(Grant {
                grantee: grantee.to_owned(),
                rights: rights.parse().ok()?,
            });
        }
        Some(Acl { grants })
    }

    fn has_data(&self, value: &Acl) -> bool {
        !value.is_empty()
    }
}

/// An item retention policy: how long to keep, and when to purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetentionPolicy {
    /// Minimum retention in seconds, if any.
    pub keep_secs: Option<u64>,
    /// Purge-after threshold in seconds, if any.
    pub purge_secs: Option<u64>,
}

/// Wire codec for [`RetentionPolicy`].
///
/// Encoding: `keep,purge` with `-` for an unset span. The empty string
/// decodes to the default policy, so a freshly created shared hash reads as
/// "no retention" rather than as corruption.
pub struct RetentionPolicyCodec;

fn encode_span(span: Option<u64>) -> String {
    match span {
        Some(secs) => secs.to_string(),
        None => "-".to_owned(),
    }
}

fn decode_span(wire: &str) -> Option<Option<u64>> {
    if wire == "-" {
        Some(None)
    } else {
        wire.parse().ok().map(Some)
    }
}

impl FieldCodec<RetentionPolicy> for RetentionPolicyCodec {
    fn encode(&self, value: &RetentionPolicy) -> String {
        format!(
            "{},{}",
            encode_span(value.keep_secs),
            encode_span(value.purge_secs)
        )
    }

    fn decode(&self, wire: &str) -> Option<RetentionPolicy> {
        if wire.is_empty() {
            return Some(RetentionPolicy::default());
        }
        let (keep, purge) = wire.split_once(',')?;
        Some(RetentionPolicy {
            keep_secs: decode_span(keep)?,
            purge_secs: decode_span(purge)?,
        })
    }
}
