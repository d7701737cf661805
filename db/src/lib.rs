//! Implementation of database support for the Kubernetes resource manager.
//!
//! The resource manager does not own any tables; it only reads the set of
//! allocations that are still open so that Kubernetes resources left behind by
//! a previous instance can be reconciled at startup.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Represents a database error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A PostgreSQL error occurred.
    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
    /// Another type of error occurred during the database operation.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The result type for database operations.
pub type DatabaseResult<T> = Result<T, Error>;

/// The identifier of an allocation.
///
/// An allocation is one scheduled instance of a task. Identifiers are created
/// by the scheduler and are opaque to the resource manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(String);

impl AllocationId {
    /// Constructs a new allocation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Gets the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{id}", id = self.0)
    }
}

impl From<String> for AllocationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for AllocationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl Borrow<str> for AllocationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// An abstraction for the resource manager's database.
#[async_trait::async_trait]
pub trait Database: Send + Sync + 'static {
    /// Gets the identifiers of every allocation that has not yet ended.
    async fn open_allocation_ids(&self) -> DatabaseResult<HashSet<AllocationId>>;
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::AllocationId;

    #[test]
    fn allocation_ids_are_looked_up_by_str() {
        let ids: HashSet<AllocationId> = ["a.1", "b.2"].into_iter().map(AllocationId::from).collect();
        assert!(ids.contains("a.1"));
        assert!(!ids.contains("c.3"));
        assert_eq!(AllocationId::new("a.1").to_string(), "a.1");
    }
}
