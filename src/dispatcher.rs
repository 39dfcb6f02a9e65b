//! Starting task executions.

use color_eyre::{eyre::WrapErr, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error};

use crate::bus::{BusMessage, EventBus, ExecutionId, LifecycleEvent};
use crate::clock::{Clock, SystemClock};
use crate::identifier::Identifier;
use crate::in_flight::{Execution, Executions, InFlight};
use crate::reconciler::Reconciler;
use crate::resource::Resource;
use crate::store::Cache;
use crate::task::{Effect, TaskDescriptor};

/// State shared by a dispatcher and the reconcilers made from it.
pub(crate) struct Shared {
  pub cache: Cache,
  pub bus: Arc<dyn EventBus>,
  pub clock: Arc<dyn Clock>,
  pub executions: Executions,
}

/// Runs task initiators and tracks the resulting executions.
///
/// Clones share one execution registry and one in-flight set, so every
/// binding handed a clone of the same dispatcher deduplicates against the
/// others.
#[derive(Clone)]
pub struct Dispatcher {
  shared: Arc<Shared>,
}

impl Dispatcher {
  pub fn new(cache: Cache, bus: Arc<dyn EventBus>) -> Self {
    Self::with_clock(cache, bus, Arc::new(SystemClock))
  }

  pub fn with_clock(cache: Cache, bus: Arc<dyn EventBus>, clock: Arc<dyn Clock>) -> Self {
    Self {
      shared: Arc::new(Shared {
        cache,
        bus,
        clock,
        executions: Executions::default(),
      }),
    }
  }

  pub fn cache(&self) -> &Cache {
    &self.shared.cache
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.shared.clock
  }

  pub fn bus(&self) -> &Arc<dyn EventBus> {
    &self.shared.bus
  }

  pub fn in_flight(&self) -> &InFlight {
    &self.shared.executions.in_flight
  }

  /// Number of executions still waiting for a terminal event.
  pub fn running(&self) -> usize {
    self.shared.executions.running()
  }

  /// A reconciler applying lifecycle events to executions started here.
  pub fn reconciler(&self) -> Reconciler {
    Reconciler::new(Arc::clone(&self.shared))
  }

  /// Fetch `descriptor.id` unless a fetch for it is already outstanding.
  ///
  /// Returns `None` when another caller holds the in-flight claim.
  pub async fn fetch(&self, descriptor: Arc<TaskDescriptor>) -> Result<Option<ExecutionId>> {
    if !self.in_flight().try_claim(&descriptor.id) {
      debug!(id = %descriptor.id, "fetch already in flight");
      return Ok(None);
    }
    self.start(descriptor, true).await.map(Some)
  }

  /// Run a task unconditionally, e.g. a mutation.
  pub async fn dispatch(&self, descriptor: Arc<TaskDescriptor>) -> Result<ExecutionId> {
    self.start(descriptor, false).await
  }

  async fn start(&self, descriptor: Arc<TaskDescriptor>, claimed: bool) -> Result<ExecutionId> {
    let execution = self.shared.executions.next_id();
    debug!(id = %descriptor.id, %execution, "starting task");

    let result = self.run_initiator(execution, &descriptor, claimed).await;
    if let Err(e) = &result {
      error!(id = %descriptor.id, %execution, "task failed to start: {:#}", e);
      self.shared.executions.finish(execution);
      if claimed {
        self.in_flight().release(&descriptor.id);
      }
    }
    result?;

    if let Some(timeout) = descriptor.options.timeout {
      self.arm_timeout(execution, descriptor.id.clone(), timeout);
    }

    Ok(execution)
  }

  async fn run_initiator(
    &self,
    execution: ExecutionId,
    descriptor: &Arc<TaskDescriptor>,
    claimed: bool,
  ) -> Result<()> {
    let cache = &self.shared.cache;

    let snapshots = if descriptor.options.rollback {
      self.snapshot(&descriptor.initiator).await?
    } else {
      Vec::new()
    };

    let now = self.shared.clock.now();
    cache
      .modify(&descriptor.id, |current| current.attempt(now))
      .await
      .wrap_err_with(|| format!("Failed to mark {} pending", descriptor.id))?;
    if descriptor.progress_target != descriptor.id {
      let target = &descriptor.progress_target;
      cache
        .modify(target, |current| current.attempt(now))
        .await
        .wrap_err_with(|| format!("Failed to mark {} pending", target))?;
    }

    // Registered before any action leaves, so a fast transport can report
    // back immediately.
    self.shared.executions.register(
      execution,
      Execution {
        descriptor: Arc::clone(descriptor),
        snapshots,
        claimed,
      },
    );

    for effect in &descriptor.initiator {
      match effect {
        Effect::Update { id, value } => {
          let now = self.shared.clock.now();
          cache
            .modify(id, |current| {
              current.succeed(value.resolve(current.data.as_ref()), now)
            })
            .await?;
        }
        Effect::Action(action) => {
          self
            .shared
            .bus
            .publish(BusMessage::Dispatch {
              task_id: descriptor.id.clone(),
              execution,
              action: action.clone(),
            })
            .await?;
        }
      }
    }

    Ok(())
  }

  /// Stored values of every initiator update target, `None` for misses.
  async fn snapshot(
    &self,
    initiator: &[Effect],
  ) -> Result<Vec<(Identifier, Option<Arc<Resource>>)>> {
    let mut snapshots: Vec<(Identifier, Option<Arc<Resource>>)> = Vec::new();
    for effect in initiator {
      if let Effect::Update { id, .. } = effect {
        if snapshots.iter().any(|(seen, _)| seen == id) {
          continue;
        }
        let current = self.shared.cache.lookup(id).await?;
        snapshots.push((id.clone(), current));
      }
    }
    Ok(snapshots)
  }

  fn arm_timeout(&self, execution: ExecutionId, task_id: Identifier, timeout: std::time::Duration) {
    let reconciler = self.reconciler();
    let shared = Arc::clone(&self.shared);
    tokio::spawn(async move {
      tokio::time::sleep(timeout).await;
      if !shared.executions.contains(execution) {
        return;
      }
      debug!(id = %task_id, %execution, "task timed out");
      let event = LifecycleEvent::failure(task_id, execution, json!({"error": "timeout"}));
      if let Err(e) = reconciler.reconcile(event).await {
        error!(%execution, "failed to reconcile timeout: {:#}", e);
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::BroadcastEventBus;
  use crate::resource::Status;
  use serde_json::json;

  fn dispatcher() -> Dispatcher {
    Dispatcher::new(Cache::memory(), Arc::new(BroadcastEventBus::default()))
  }

  #[tokio::test]
  async fn test_dispatch_marks_pending_and_tags_actions() {
    let dispatcher = dispatcher();
    let mut bus = dispatcher.bus().subscribe();
    let id = Identifier::new("user", "1");
    let task = Arc::new(TaskDescriptor::new(id.clone()).initiate(Effect::action(json!("GET"))));

    let execution = dispatcher.dispatch(task).await.unwrap();

    let resource = dispatcher.cache().read(&id).await.unwrap();
    assert_eq!(resource.status, Status::Pending);
    assert!(resource.last_attempt.is_some());
    assert_eq!(
      bus.recv().await.unwrap(),
      BusMessage::Dispatch {
        task_id: id,
        execution,
        action: json!("GET"),
      }
    );
    assert_eq!(dispatcher.running(), 1);
  }

  #[tokio::test]
  async fn test_fetch_dedups_by_identifier() {
    let dispatcher = dispatcher();
    let task = Arc::new(TaskDescriptor::new(Identifier::new("feed", "home")));

    assert!(dispatcher.fetch(Arc::clone(&task)).await.unwrap().is_some());
    assert!(dispatcher.clone().fetch(task).await.unwrap().is_none());
    assert_eq!(dispatcher.running(), 1);
  }

  #[tokio::test]
  async fn test_initiator_updates_apply_in_order() {
    let dispatcher = dispatcher();
    let counter = Identifier::new("counter", "likes");
    let task = Arc::new(
      TaskDescriptor::new(Identifier::one_off("like-1"))
        .initiate(Effect::update(counter.clone(), json!(10)))
        .initiate(Effect::transform(counter.clone(), |prev| {
          json!(prev.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
        })),
    );

    dispatcher.dispatch(task).await.unwrap();

    let resource = dispatcher.cache().read(&counter).await.unwrap();
    assert_eq!(resource.status, Status::Success);
    assert_eq!(resource.data, Some(json!(11)));
  }
}
