use std::{
    collections::BTreeMap,
    convert::Infallible,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::{
    envelope::Envelope,
    transaction::{TransactionFactory, TransactionOptions},
};

/// An in-memory key/value store with unit-of-work transactions, for testing
/// or local usage.
///
/// Changes are staged in a [`UnitOfWork`] and applied to the store on commit.
/// A unit of work dropped without commit leaves the store untouched.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    values: Mutex<BTreeMap<String, serde_json::Value>>,
    begun: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value for `key`.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.shared.values.lock().await.get(key).cloned()
    }

    /// All committed values, ordered by key.
    pub async fn snapshot(&self) -> BTreeMap<String, serde_json::Value> {
        self.shared.values.lock().await.clone()
    }

    /// Number of transactions begun so far.
    pub fn begun(&self) -> usize {
        self.shared.begun.load(Ordering::SeqCst)
    }

    pub fn committed(&self) -> usize {
        self.shared.committed.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.shared.rolled_back.load(Ordering::SeqCst)
    }

    /// Start a unit of work outside of a dispatch, e.g. to join it.
    pub fn unit_of_work(&self) -> UnitOfWork {
        self.shared.begun.fetch_add(1, Ordering::SeqCst);
        UnitOfWork {
            shared: Arc::clone(&self.shared),
            staged: BTreeMap::new(),
            completed: false,
        }
    }

    /// Apply the changes staged in `tx`.
    pub async fn commit(&self, mut tx: UnitOfWork) {
        let staged = std::mem::take(&mut tx.staged);
        self.shared.values.lock().await.extend(staged);
        tx.completed = true;
        self.shared.committed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Pending changes against an [`InMemoryStore`].
pub struct UnitOfWork {
    shared: Arc<Shared>,
    staged: BTreeMap<String, serde_json::Value>,
    completed: bool,
}

impl UnitOfWork {
    /// Stage `value` under `key`.
    pub fn put(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), serde_json::Error> {
        self.staged.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Value staged by this unit of work for `key`.
    pub fn staged(&self, key: &str) -> Option<&serde_json::Value> {
        self.staged.get(key)
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if !self.completed {
            self.shared.rolled_back.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(discarded = self.staged.len(), "Unit of work rolled back");
        }
    }
}

#[async_trait]
impl TransactionFactory for InMemoryStore {
    type Transaction = UnitOfWork;
    type Error = Infallible;

    async fn begin(
        &self,
        envelope: &Envelope,
        options: &TransactionOptions,
    ) -> Result<UnitOfWork, Infallible> {
        tracing::trace!(
            envelope_id = envelope.id(),
            isolation_level = ?options.isolation_level,
            "Unit of work begun"
        );
        Ok(self.unit_of_work())
    }

    async fn commit(&self, tx: UnitOfWork) -> Result<(), Infallible> {
        InMemoryStore::commit(self, tx).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope::builder("e").message(()).build().unwrap()
    }

    #[tokio::test]
    async fn committed_changes_become_visible() {
        let store = InMemoryStore::new();
        let mut tx = TransactionFactory::begin(&store, &envelope(), &TransactionOptions::default())
            .await
            .unwrap();
        tx.put("balance", 10).unwrap();
        assert_eq!(store.get("balance").await, None);

        TransactionFactory::commit(&store, tx).await.unwrap();

        assert_eq!(store.get("balance").await, Some(serde_json::json!(10)));
        assert_eq!((store.begun(), store.committed(), store.rolled_back()), (1, 1, 0));
    }

    #[tokio::test]
    async fn dropped_units_of_work_roll_back() {
        let store = InMemoryStore::new();
        {
            let mut tx = store.unit_of_work();
            tx.put("balance", 10).unwrap();
            assert_eq!(tx.staged("balance"), Some(&serde_json::json!(10)));
        }

        assert!(store.snapshot().await.is_empty());
        assert_eq!((store.begun(), store.committed(), store.rolled_back()), (1, 0, 1));
    }
}
