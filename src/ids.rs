//! Stable identifiers used throughout the storage core.
//!
//! Every identifier that crosses a filesystem boundary (as a filename
//! prefix, a directory name, or a field in a persisted payload) is a UUID
//! v4 wrapped in its own type so callers cannot accidentally swap, say, a
//! `NoteId` for a `FolderId` at a call site.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random (v4) id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID, e.g. one read back from disk.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

/// Stable identifier for one running application instance.
///
/// Used as the sole writer-identity prefix for any file this instance
/// writes. Normally a freshly generated v4 UUID, but a test harness may
/// override it on the command line with an arbitrary string (including
/// one containing underscores) — so unlike [`SdUuid`]/[`NoteId`]/
/// [`FolderId`], this is a string newtype rather than a `Uuid` wrapper.
/// [`crate::filename`]'s grammar is written so such ids still round-trip
/// through filenames.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a new random (v4) instance id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an arbitrary string as an instance id, e.g. a command-line
    /// override supplied by a test harness.
    pub fn from_str_override(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<Uuid> for InstanceId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

uuid_id!(
    SdUuid,
    "Filesystem-anchored identity of a Storage Directory, read from/written to `{sd}/SD_ID`.\n\n\
     Stable across instances, unlike the local `SdId` database key."
);

uuid_id!(NoteId, "Identifies one note's CRDT document.");

uuid_id!(FolderId, "Identifies one folder within a Storage Directory's folder-tree document.");

uuid_id!(MoveId, "Identifies one cross-SD move record.");

/// Local, per-profile database key for a configured Storage Directory.
///
/// Unlike [`SdUuid`], this is not shared across instances: two instances may
/// assign different `SdId`s to the same SD, but must agree on its `SdUuid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SdId(pub i64);

impl fmt::Display for SdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
