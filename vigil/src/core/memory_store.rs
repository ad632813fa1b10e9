use crate::core::job::JobDocument;
use crate::core::store::{JobFilter, JobStore, JobUpdate, SortKey, StoreError};
use crate::core::Xid;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Process-local store. Every `find_and_modify` runs under one write lock, so it is atomic for
/// all queues, workers and watchdogs sharing a clone of this store. It does not survive a
/// restart and cannot be shared between processes.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    documents: Arc<RwLock<HashMap<Xid, JobDocument>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All documents, oldest first.
    pub fn list(&self) -> Result<Vec<JobDocument>, StoreError> {
        let inner = self.documents.read().map_err(|_| StoreError::Poisoned)?;
        let mut docs: Vec<JobDocument> = inner.values().cloned().collect();
        docs.sort_by(|a, b| sort_order(SortKey::CreatedAt, a, b));
        Ok(docs)
    }
}

fn sort_order(sort: SortKey, a: &JobDocument, b: &JobDocument) -> std::cmp::Ordering {
    let by_key = match sort {
        SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        SortKey::TimeoutAt => a.timeout_at.cmp(&b.timeout_at),
    };
    by_key.then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, document: JobDocument) -> Result<JobDocument, StoreError> {
        let mut inner = self.documents.write().map_err(|_| StoreError::Poisoned)?;
        inner.insert(document.id, document.clone());
        Ok(document)
    }

    async fn find_and_modify(
        &self,
        filter: &JobFilter,
        sort: SortKey,
        update: &JobUpdate,
    ) -> Result<Option<JobDocument>, StoreError> {
        let mut inner = self.documents.write().map_err(|_| StoreError::Poisoned)?;
        let target = inner
            .values()
            .filter(|doc| filter.matches(doc))
            .min_by(|a, b| sort_order(sort, a, b))
            .map(|doc| doc.id);

        Ok(target.and_then(|id| {
            inner.get_mut(&id).map(|doc| {
                update.apply(doc);
                doc.clone()
            })
        }))
    }

    async fn get(&self, id: Xid) -> Result<Option<JobDocument>, StoreError> {
        let inner = self.documents.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.get(&id).cloned())
    }
}
