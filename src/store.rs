use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use crate::error::StoreError;
use crate::ledger::LedgerSnapshot;

/// Persistence collaborator. The medium is opaque to the pipeline.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// `Ok(None)` on a cold start
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError>;

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError>;

    /// Backend name for logging
    fn backend_type(&self) -> &'static str;
}

/// Keeps the last saved snapshot in memory
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    saved: Mutex<Option<LedgerSnapshot>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
        }
    }

    pub fn last_saved(&self) -> Option<LedgerSnapshot> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.last_saved())
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
