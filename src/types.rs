//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// BLAKE3 digest
pub type Hash = [u8; 32];

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Transport-level connection identity. Ephemeral.
    ConnectionId
);

string_id!(
    /// Identity resolved by a context's `authorize` capability.
    ClientId
);

string_id!(
    /// Deterministic id of a context, derived from its name and params.
    ContextId
);

string_id!(
    /// Deterministic key of an active query, derived from its name and params.
    QueryKey
);

string_id!(
    /// Transport broadcast group.
    GroupId
);

impl From<&ContextId> for GroupId {
    fn from(id: &ContextId) -> Self {
        GroupId(id.0.clone())
    }
}

impl From<&QueryKey> for GroupId {
    fn from(key: &QueryKey) -> Self {
        GroupId(key.0.clone())
    }
}
