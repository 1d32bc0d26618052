//! Shared store handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use surrealdb::{Connection, Surreal};
use tracing::info;
use uuid::Uuid;

use crate::transaction::SurrealTransaction;

/// Configuration for the group store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// How long a transaction waits for a single row lock before giving
    /// up with a retryable contention error (default: 5000).
    pub lock_wait_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_wait_timeout_ms)
    }
}

pub(crate) type RowLock = Arc<tokio::sync::Mutex<()>>;

struct StoreInner<C: Connection> {
    db: Surreal<C>,
    config: StoreConfig,
    row_locks: Mutex<HashMap<Uuid, RowLock>>,
    commit_lock: tokio::sync::Mutex<()>,
}

/// Handle to the group graph in SurrealDB. Cheap to clone; all clones
/// share the client and the lock tables.
///
/// Per-group row locks play the part of `SELECT ... FOR UPDATE`: they are
/// only taken by transactions that ask for them and are held until the
/// transaction ends. Commits are validated and written one at a time.
pub struct GraphStore<C: Connection> {
    inner: Arc<StoreInner<C>>,
}

impl<C: Connection> Clone for GraphStore<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connection> GraphStore<C> {
    /// Wrap a connected client. The schema must already be migrated.
    pub fn new(db: Surreal<C>, config: StoreConfig) -> Self {
        info!(
            lock_wait_timeout_ms = config.lock_wait_timeout_ms,
            "Initializing group store"
        );

        Self {
            inner: Arc::new(StoreInner {
                db,
                config,
                row_locks: Mutex::new(HashMap::new()),
                commit_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn begin(&self) -> SurrealTransaction<C> {
        SurrealTransaction::new(self.clone())
    }

    /// Groups that currently have a row-lock entry, held or awaited.
    pub fn row_lock_entries(&self) -> usize {
        self.row_locks().len()
    }

    pub(crate) fn db(&self) -> &Surreal<C> {
        &self.inner.db
    }

    pub(crate) async fn commit_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.commit_lock.lock().await
    }

    pub(crate) fn row_lock(&self, id: Uuid) -> RowLock {
        self.row_locks().entry(id).or_default().clone()
    }

    /// Forget entries nobody holds or waits on any more. Callers drop their
    /// guards and `Arc`s first.
    pub(crate) fn prune_row_locks(&self, ids: impl IntoIterator<Item = Uuid>) {
        let mut locks = self.row_locks();
        for id in ids {
            if locks
                .get(&id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(&id);
            }
        }
    }

    fn row_locks(&self) -> MutexGuard<'_, HashMap<Uuid, RowLock>> {
        self.inner
            .row_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
