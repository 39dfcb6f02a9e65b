//! The storage backend contract.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;

use crate::identifier::Identifier;
use crate::resource::Resource;

/// Asynchronous mapping from [`Identifier`] to [`Resource`].
///
/// A store only holds what was explicitly set. It never infers staleness,
/// never merges and has no compare-and-swap; concurrent writers coordinate
/// through [`Cache`](super::Cache).
#[async_trait]
pub trait Store: Send + Sync {
  /// Look up an entry. A miss is `Ok(None)`, never an error.
  async fn get(&self, id: &Identifier) -> Result<Option<Arc<Resource>>>;

  /// Replace the entry at `id`.
  async fn set(&self, id: &Identifier, resource: Arc<Resource>) -> Result<()>;

  /// Drop the entry at `id`, if any.
  async fn remove(&self, id: &Identifier) -> Result<()>;

  /// Every stored entry, ordered by identifier.
  async fn entries(&self) -> Result<Vec<(Identifier, Arc<Resource>)>>;
}
