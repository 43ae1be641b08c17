//! Correlation id type for bridged requests.
//!
//! This module provides a type-safe wrapper for request ids, preventing
//! confusion with other string payload fields.

use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

/// Correlation id linking one outbound request to its eventual reply.
///
/// Wraps a ULID. Ids are generated by the bridge, so uniqueness only has to
/// hold within one process; ULIDs also sort by creation time, which keeps
/// log output readable.
///
/// # Wire Format
///
/// Serialized as the 26-character Crockford base32 string in the `id` field
/// of every outbound request. Replies whose `id` is missing or not a ULID are
/// treated as out-of-band notifications rather than correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Ulid);

impl RequestId {
    /// Generate a fresh request id.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Extract a RequestId from a JSON message.
    ///
    /// Returns `None` if the message has no string `id` field or the value is
    /// not a ULID.
    pub(crate) fn from_json(message: &serde_json::Value) -> Option<Self> {
        message.get("id")?.as_str()?.parse().ok()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RequestId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}
