//! Persistence seam.
//!
//! Components never perform I/O themselves; they are handed a
//! `Repository<T>` for each record type they own. The storage format behind
//! it is the caller's business.

use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Repository lock poisoned")]
    Poisoned,
}

/// Load/save by id.
pub trait Repository<T>: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<T>, RepositoryError>;

    fn save(&self, id: &str, value: &T) -> Result<(), RepositoryError>;

    /// All stored ids, used by background sweeps.
    fn ids(&self) -> Result<Vec<String>, RepositoryError>;
}

/// In-memory repository, used by tests and single-process deployments.
#[derive(Debug)]
pub struct MemoryRepository<T> {
    records: RwLock<HashMap<String, T>>,
}

impl<T> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync> Repository<T> for MemoryRepository<T> {
    fn load(&self, id: &str) -> Result<Option<T>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(records.get(id).cloned())
    }

    fn save(&self, id: &str, value: &T) -> Result<(), RepositoryError> {
        let mut records = self.records.write().map_err(|_| RepositoryError::Poisoned)?;
        records.insert(id.to_string(), value.clone());
        Ok(())
    }

    fn ids(&self) -> Result<Vec<String>, RepositoryError> {
        let records = self.records.read().map_err(|_| RepositoryError::Poisoned)?;
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
