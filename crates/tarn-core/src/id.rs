//! Strongly-typed identifiers for Tarn entities.
//!
//! All identifiers in Tarn are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! # Example
//!
//! ```rust
//! use tarn_core::id::{ChainId, RequestId};
//!
//! let chain = ChainId::generate();
//! let request = RequestId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: ChainId = request;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique identifier.
            ///
            /// Uses ULID generation which is lexicographically sortable by
            /// creation time and globally unique without coordination.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an identifier from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                #[allow(clippy::cast_possible_wrap)]
                chrono::DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!(concat!("invalid ", $label, " ID '{}': {}"), s, e),
                    })
            }
        }
    };
}

define_id!(
    /// A unique identifier for a job.
    ///
    /// Jobs are the hierarchical unit-of-work records tracked by the flow
    /// engine; every request and chain is anchored to one.
    JobId,
    "job"
);

define_id!(
    /// A unique identifier for a single lookup → processing → responding
    /// request.
    RequestId,
    "request"
);

define_id!(
    /// A unique identifier for a declarative chain of requests.
    ChainId,
    "chain"
);

define_id!(
    /// A unique identifier for a stored content entry.
    ///
    /// Content entries are produced by archive lookups, processors, and
    /// responders, and consumed via the content store.
    ContentId,
    "content"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrip() {
        let id = RequestId::generate();
        let s = id.to_string();
        let parsed: RequestId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn chain_id_roundtrip() {
        let id = ChainId::generate();
        let s = id.to_string();
        let parsed: ChainId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        let id1 = JobId::generate();
        let id2 = JobId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<ContentId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }
}
