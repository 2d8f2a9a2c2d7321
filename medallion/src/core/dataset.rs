//! References to materialized datasets.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a stage's output lives, staged or committed.
///
/// The orchestrator never reads dataset contents; it only passes references
/// between units of work, checks and the output store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetRef {
    /// Location understood by the output store (a path or a URI).
    pub uri: String,
}

impl DatasetRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    /// The location as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}
