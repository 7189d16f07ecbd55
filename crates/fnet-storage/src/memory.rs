//! In-process store with the same commit semantics as the Postgres one.
//! Used by tests and local experiments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use fnet_core::{DocumentRecord, NaturalKey, StoredDocument};

use crate::{DocumentStore, StoreError, StoreSession, UpsertOutcome};

#[derive(Debug, Default)]
struct InMemoryState {
    rows: BTreeMap<NaturalKey, StoredDocument>,
    commits: usize,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with already committed rows. Seeding does not count
    /// as a commit.
    pub fn with_documents(records: impl IntoIterator<Item = DocumentRecord>) -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            let inserted_at = Utc::now();
            for record in records {
                state.rows.insert(
                    record.natural_key(),
                    StoredDocument {
                        record,
                        inserted_at,
                        last_update: None,
                    },
                );
            }
        }
        store
    }

    /// Committed rows ordered by natural key.
    pub fn documents(&self) -> Vec<StoredDocument> {
        self.lock().rows.values().cloned().collect()
    }

    pub fn get(&self, key: &NaturalKey) -> Option<StoredDocument> {
        self.lock().rows.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful [`StoreSession::commit`] calls across all sessions.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    type Session = InMemorySession;

    async fn begin(&self) -> Result<Self::Session, StoreError> {
        Ok(InMemorySession {
            store: self.clone(),
            pending: BTreeMap::new(),
        })
    }

    async fn last_delivery_timestamp(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        Ok(self
            .lock()
            .rows
            .values()
            .map(|doc| doc.record.delivery_timestamp)
            .max())
    }

    async fn document_ids_after(
        &self,
        after: Option<i64>,
        exclude: &[i64],
        limit: usize,
    ) -> Result<Vec<i64>, StoreError> {
        let ids: BTreeSet<i64> = self.lock().rows.keys().map(|key| key.document_id).collect();
        Ok(ids
            .into_iter()
            .filter(|id| after.map_or(true, |after| *id > after))
            .filter(|id| !exclude.contains(id))
            .take(limit)
            .collect())
    }
}

/// Buffers writes until commit; dropping it discards them.
#[derive(Debug)]
pub struct InMemorySession {
    store: InMemoryDocumentStore,
    pending: BTreeMap<NaturalKey, StoredDocument>,
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn upsert(&mut self, record: &DocumentRecord) -> Result<UpsertOutcome, StoreError> {
        let key = record.natural_key();
        let existing_inserted_at = match self.pending.get(&key) {
            Some(doc) => Some(doc.inserted_at),
            None => self.store.lock().rows.get(&key).map(|doc| doc.inserted_at),
        };

        let now = Utc::now();
        let (stored, outcome) = match existing_inserted_at {
            Some(inserted_at) => (
                StoredDocument {
                    record: record.clone(),
                    inserted_at,
                    last_update: Some(now),
                },
                UpsertOutcome::Updated,
            ),
            None => (
                StoredDocument {
                    record: record.clone(),
                    inserted_at: now,
                    last_update: None,
                },
                UpsertOutcome::Inserted,
            ),
        };
        self.pending.insert(key, stored);
        Ok(outcome)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.store.lock();
        state.rows.extend(pending);
        state.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        Ok(())
    }
}
