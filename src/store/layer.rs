//! Cache handle that sits in front of a [`Store`].

use color_eyre::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

use super::memory::MemoryStore;
use super::traits::Store;
use crate::identifier::Identifier;
use crate::resource::Resource;

type EntryLocks = HashMap<Identifier, Arc<tokio::sync::Mutex<()>>>;

/// Default capacity of the change notification channel.
const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// The single source of truth for resource values.
///
/// Constructed explicitly (empty) and shared by cloning; there is no global
/// instance and no teardown. Read-modify-write cycles on the same identifier
/// are serialized by a per-identifier lock, and every write is announced on
/// a broadcast channel.
pub struct Cache {
  store: Arc<dyn Store>,
  locks: Arc<Mutex<EntryLocks>>,
  changes: broadcast::Sender<Identifier>,
}

impl Cache {
  /// Create a cache over the given storage backend.
  pub fn new(store: impl Store + 'static) -> Self {
    Self::with_capacity(store, DEFAULT_CHANGE_CAPACITY)
  }

  /// Create a cache whose change channel holds `capacity` notifications.
  pub fn with_capacity(store: impl Store + 'static, capacity: usize) -> Self {
    let (changes, _) = broadcast::channel(capacity.max(1));
    Self {
      store: Arc::new(store),
      locks: Arc::new(Mutex::new(HashMap::new())),
      changes,
    }
  }

  /// An empty in-memory cache.
  pub fn memory() -> Self {
    Self::new(MemoryStore::new())
  }

  /// Resolve the current resource at `id`. Misses at either the category
  /// or the key level resolve to [`Resource::uninitialized`].
  pub async fn read(&self, id: &Identifier) -> Result<Arc<Resource>> {
    Ok(
      self
        .store
        .get(id)
        .await?
        .unwrap_or_else(Resource::uninitialized),
    )
  }

  /// The stored entry at `id`, without resolving a miss.
  pub async fn lookup(&self, id: &Identifier) -> Result<Option<Arc<Resource>>> {
    self.store.get(id).await
  }

  /// Put back a value previously obtained from [`Cache::lookup`]: the
  /// entry is written, or removed if there was none.
  pub async fn restore(&self, id: &Identifier, previous: Option<Arc<Resource>>) -> Result<()> {
    let _guard = self.lock_entry(id).await;
    match previous {
      Some(resource) => self.store.set(id, resource).await?,
      None => self.store.remove(id).await?,
    }
    self.announce(id);
    Ok(())
  }

  /// Replace the entry at `id` and announce the change.
  pub async fn write(&self, id: &Identifier, resource: Arc<Resource>) -> Result<()> {
    let _guard = self.lock_entry(id).await;
    self.store.set(id, resource).await?;
    self.announce(id);
    Ok(())
  }

  /// Apply `transition` to the current resource at `id` and store the
  /// result. No other `modify` or `write` on the same identifier interleaves
  /// between the read and the write.
  pub async fn modify<F>(&self, id: &Identifier, transition: F) -> Result<Arc<Resource>>
  where
    F: FnOnce(&Resource) -> Resource,
  {
    let stored = self
      .modify_if(id, |current| Some(transition(current)))
      .await?;
    Ok(stored.unwrap_or_else(Resource::uninitialized))
  }

  /// Like [`Cache::modify`], but nothing is written when `transition`
  /// returns `None`.
  pub async fn modify_if<F>(&self, id: &Identifier, transition: F) -> Result<Option<Arc<Resource>>>
  where
    F: FnOnce(&Resource) -> Option<Resource>,
  {
    let _guard = self.lock_entry(id).await;

    let current = self.read(id).await?;
    let Some(next) = transition(&current) else {
      return Ok(None);
    };
    let next = Arc::new(next);
    self.store.set(id, Arc::clone(&next)).await?;
    self.announce(id);

    Ok(Some(next))
  }

  /// Subscribe to state changes. Each message is the identifier that was
  /// written; dropping the receiver unsubscribes.
  pub fn subscribe(&self) -> broadcast::Receiver<Identifier> {
    self.changes.subscribe()
  }

  /// Every stored entry, for inspection.
  pub async fn entries(&self) -> Result<Vec<(Identifier, Arc<Resource>)>> {
    self.store.entries().await
  }

  async fn lock_entry(&self, id: &Identifier) -> EntryGuard {
    let lock = Arc::clone(lock_map(&self.locks).entry(id.clone()).or_default());
    let guard = Arc::clone(&lock).lock_owned().await;
    EntryGuard {
      id: id.clone(),
      locks: Arc::clone(&self.locks),
      lock: Some(lock),
      guard: Some(guard),
    }
  }

  fn announce(&self, id: &Identifier) {
    trace!(%id, "resource changed");
    // No subscribers is fine
    let _ = self.changes.send(id.clone());
  }
}

fn lock_map(locks: &Mutex<EntryLocks>) -> MutexGuard<'_, EntryLocks> {
  match locks.lock() {
    Ok(locks) => locks,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// Holds the lock for one identifier. The lock entry is dropped from the
/// map once nobody else holds or waits for it.
struct EntryGuard {
  id: Identifier,
  locks: Arc<Mutex<EntryLocks>>,
  lock: Option<Arc<tokio::sync::Mutex<()>>>,
  guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for EntryGuard {
  fn drop(&mut self) {
    let mut locks = lock_map(&self.locks);
    drop(self.guard.take());
    drop(self.lock.take());
    // Clones are only taken under the map lock, so a count of one means
    // the map holds the last reference.
    if locks.get(&self.id).is_some_and(|l| Arc::strong_count(l) == 1) {
      locks.remove(&self.id);
    }
  }
}

impl Clone for Cache {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      locks: Arc::clone(&self.locks),
      changes: self.changes.clone(),
    }
  }
}
