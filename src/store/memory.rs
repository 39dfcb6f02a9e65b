//! In-process store.

use async_trait::async_trait;
use color_eyre::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::Store;
use crate::identifier::Identifier;
use crate::resource::Resource;

type Entries = HashMap<String, Arc<Resource>>;

/// Stores resources keyed by category, then by key.
///
/// Values are handed out as the same `Arc` that was stored, so an entry
/// nobody wrote to compares equal by pointer across reads.
#[derive(Debug, Default)]
pub struct MemoryStore {
  categories: RwLock<HashMap<Option<String>, Entries>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn get(&self, id: &Identifier) -> Result<Option<Arc<Resource>>> {
    let categories = self.categories.read().await;
    Ok(
      categories
        .get(&id.category)
        .and_then(|entries| entries.get(&id.key))
        .cloned(),
    )
  }

  async fn set(&self, id: &Identifier, resource: Arc<Resource>) -> Result<()> {
    let mut categories = self.categories.write().await;
    categories
      .entry(id.category.clone())
      .or_default()
      .insert(id.key.clone(), resource);
    Ok(())
  }

  async fn remove(&self, id: &Identifier) -> Result<()> {
    let mut categories = self.categories.write().await;
    if let Some(entries) = categories.get_mut(&id.category) {
      entries.remove(&id.key);
      if entries.is_empty() {
        categories.remove(&id.category);
      }
    }
    Ok(())
  }

  async fn entries(&self) -> Result<Vec<(Identifier, Arc<Resource>)>> {
    let categories = self.categories.read().await;
    let mut all: Vec<_> = categories
      .iter()
      .flat_map(|(category, entries)| {
        entries.iter().map(move |(key, resource)| {
          (
            Identifier {
              category: category.clone(),
              key: key.clone(),
            },
            Arc::clone(resource),
          )
        })
      })
      .collect();
    all.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(all)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Utc;
  use serde_json::json;

  #[tokio::test]
  async fn test_miss_at_category_and_key_level() {
    let store = MemoryStore::new();
    let id = Identifier::new("user", "1");
    assert!(store.get(&id).await.unwrap().is_none());

    store
      .set(&id, Arc::new(Resource::uninitialized().attempt(Utc::now())))
      .await
      .unwrap();
    assert!(store.get(&id).await.unwrap().is_some());
    assert!(store
      .get(&Identifier::new("user", "2"))
      .await
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_returns_stored_arc() {
    let store = MemoryStore::new();
    let id = Identifier::one_off("save");
    let resource = Arc::new(Resource::uninitialized().succeed(json!(1), Utc::now()));
    store.set(&id, Arc::clone(&resource)).await.unwrap();

    let read = store.get(&id).await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&read, &resource));
  }

  #[tokio::test]
  async fn test_last_write_wins_and_entries_sorted() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let b = Identifier::new("b", "1");
    let a = Identifier::new("a", "1");
    store
      .set(&b, Arc::new(Resource::uninitialized().succeed(json!("old"), now)))
      .await
      .unwrap();
    store
      .set(&b, Arc::new(Resource::uninitialized().succeed(json!("new"), now)))
      .await
      .unwrap();
    store
      .set(&a, Arc::new(Resource::uninitialized().attempt(now)))
      .await
      .unwrap();

    let entries = store.entries().await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, a);
    assert_eq!(entries[1].1.data, Some(json!("new")));
  }
}
