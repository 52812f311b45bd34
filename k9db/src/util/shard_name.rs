//! Shard identifiers.

use std::fmt;

use crate::sql::rocks::encode::SEPARATOR;

/// Shard kind and user id of the reserved shard holding orphaned rows.
pub const DEFAULT_SHARD: &str = "#default";

/// Identifies one physical shard: the data-subject table that owns it and
/// the decoded primary key of the owning user.
///
/// Serialized as `<kind> 0x1E <user id>`, the same byte layout used for
/// row key prefixes, so a shard name can be matched against a key prefix
/// without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardName {
    shard_kind: String,
    user_id: String,
}

impl ShardName {
    pub fn new(shard_kind: impl Into<String>, user_id: impl Into<String>) -> Self {
        ShardName {
            shard_kind: shard_kind.into(),
            user_id: user_id.into(),
        }
    }

    /// The reserved shard for rows with no owner.
    pub fn default_shard() -> Self {
        Self::new(DEFAULT_SHARD, DEFAULT_SHARD)
    }

    pub fn is_default(&self) -> bool {
        self.shard_kind == DEFAULT_SHARD
    }

    pub fn shard_kind(&self) -> &str {
        &self.shard_kind
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Byte form used inside row keys.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.shard_kind.len() + self.user_id.len() + 1);
        out.extend_from_slice(self.shard_kind.as_bytes());
        out.push(SEPARATOR);
        out.extend_from_slice(self.user_id.as_bytes());
        out
    }

    /// Parse the byte form back. Panics on malformed input: shard names are
    /// only ever produced by this type.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let sep = bytes
            .iter()
            .position(|b| *b == SEPARATOR)
            .expect("shard name without separator");
        ShardName {
            shard_kind: String::from_utf8_lossy(&bytes[..sep]).into_owned(),
            user_id: String::from_utf8_lossy(&bytes[sep + 1..]).into_owned(),
        }
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.shard_kind, self.user_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let shard = ShardName::new("User", "42");
        assert_eq!(ShardName::from_bytes(&shard.as_bytes()), shard);
        assert!(!shard.is_default());
        assert!(ShardName::default_shard().is_default());
    }
}
