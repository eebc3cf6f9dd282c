//! Request/response tags.
//!
//! Tags are application-defined markers distinguishing the role of data
//! flowing through a buffer when several request/response kinds share a
//! naming scheme. The middleware stores them in the buffer header and
//! never interprets them.

use serde::{Deserialize, Serialize};

/// An application-defined tag value carried in the buffer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceTag(pub u32);

impl ServiceTag {
    /// Tag used when the application defines no finer scheme.
    pub const UNTAGGED: ServiceTag = ServiceTag(0);

    /// Raw header word.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ServiceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tag:{}", self.0)
    }
}

impl From<u32> for ServiceTag {
    fn from(value: u32) -> Self {
        ServiceTag(value)
    }
}
