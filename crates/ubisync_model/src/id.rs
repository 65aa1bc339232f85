//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from an existing string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generates a fresh random identifier (UUIDv4 string form).
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id! {
    /// Stable cross-device identifier of a synced entity.
    ///
    /// Sync IDs are:
    /// - Globally unique within a document
    /// - Assigned exactly once, at first local insertion
    /// - Immutable and never reused
    ///
    /// After the entity is deleted the ID remains valid as a tombstone key,
    /// so late-arriving changes referencing it can be suppressed.
    SyncId
}

opaque_id! {
    /// Identifier of one device participating in a document's sync.
    DeviceId
}

opaque_id! {
    /// Identifier of one logical document shared between devices.
    DocumentId
}
