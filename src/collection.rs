//! Collection names and the small integer ids the record cache keys on.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;

use crate::error::Result;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(pub u16);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Translates a collection name into its id.
pub trait CollectionResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<CollectionId>;
}

/// In-memory registry handing out ids in order of first registration.
#[derive(Debug, Default)]
pub struct Collections {
    inner: RwLock<Registry>,
}

#[derive(Debug, Default)]
struct Registry {
    by_name: HashMap<String, CollectionId>,
    next: u16,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the id for `name`, assigning the next free one on first use.
    pub fn register(&self, name: &str) -> Result<CollectionId> {
        if let Some(id) = self.inner.read().by_name.get(name) {
            return Ok(*id);
        }
        let mut inner = self.inner.write();
        if let Some(id) = inner.by_name.get(name) {
            return Ok(*id);
        }
        if inner.next == u16::MAX {
            return Err(Error::InvalidState(format!(
                "no collection ids left for {}",
                name
            )));
        }
        let id = CollectionId(inner.next);
        inner.next += 1;
        inner.by_name.insert(name.to_string(), id);
        tracing::debug!(collection = name, id = id.0, "Registered collection");
        Ok(id)
    }

    /// Forgets `name`. Its id is not handed out again.
    pub fn remove(&self, name: &str) -> Option<CollectionId> {
        self.inner.write().by_name.remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CollectionResolver for Collections {
    fn resolve(&self, name: &str) -> Option<CollectionId> {
        self.inner.read().by_name.get(name).copied()
    }
}
