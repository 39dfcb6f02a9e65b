//! Bookkeeping for running executions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::bus::ExecutionId;
use crate::identifier::Identifier;
use crate::resource::Resource;
use crate::task::TaskDescriptor;

/// Identifiers with an outstanding fetch.
///
/// This is the only mutual exclusion between fetches: whoever wins
/// [`InFlight::try_claim`] dispatches, everybody else skips.
#[derive(Debug, Default)]
pub struct InFlight {
  ids: Mutex<HashSet<Identifier>>,
}

impl InFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// Atomically check and mark `id`. Returns `false` if it was already
  /// in flight.
  pub fn try_claim(&self, id: &Identifier) -> bool {
    self.lock().insert(id.clone())
  }

  pub fn release(&self, id: &Identifier) {
    self.lock().remove(id);
  }

  pub fn contains(&self, id: &Identifier) -> bool {
    self.lock().contains(id)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> MutexGuard<'_, HashSet<Identifier>> {
    match self.ids.lock() {
      Ok(ids) => ids,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}

/// A registered execution awaiting lifecycle events.
#[derive(Debug, Clone)]
pub(crate) struct Execution {
  pub descriptor: Arc<TaskDescriptor>,
  /// Prior values of initiator update targets, restored on failure
  pub snapshots: Vec<(Identifier, Option<Arc<Resource>>)>,
  /// Whether this execution holds the in-flight claim for its id
  pub claimed: bool,
}

/// Registry of running executions, keyed by execution id.
#[derive(Debug, Default)]
pub(crate) struct Executions {
  next: AtomicU64,
  running: Mutex<HashMap<ExecutionId, Execution>>,
  pub in_flight: InFlight,
}

impl Executions {
  pub fn next_id(&self) -> ExecutionId {
    ExecutionId(self.next.fetch_add(1, Ordering::Relaxed) + 1)
  }

  pub fn register(&self, id: ExecutionId, execution: Execution) {
    self.lock().insert(id, execution);
  }

  pub fn get(&self, id: ExecutionId) -> Option<Execution> {
    self.lock().get(&id).cloned()
  }

  pub fn contains(&self, id: ExecutionId) -> bool {
    self.lock().contains_key(&id)
  }

  /// Remove a finished execution.
  pub fn finish(&self, id: ExecutionId) -> Option<Execution> {
    self.lock().remove(&id)
  }

  pub fn running(&self) -> usize {
    self.lock().len()
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<ExecutionId, Execution>> {
    match self.running.lock() {
      Ok(running) => running,
      Err(poisoned) => poisoned.into_inner(),
    }
  }
}
