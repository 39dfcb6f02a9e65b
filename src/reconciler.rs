//! Applying lifecycle events to the cache.

use color_eyre::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::bus::{BusMessage, LifecycleEvent, LifecycleState};
use crate::dispatcher::Shared;
use crate::identifier::Identifier;
use crate::in_flight::Execution;
use crate::task::{Effect, TaskDescriptor};

/// How update effects land on their targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
  Success,
  Failure,
}

/// Applies lifecycle events to the cache through the originating
/// descriptor's handlers.
///
/// Obtained from [`Dispatcher::reconciler`](crate::Dispatcher::reconciler).
#[derive(Clone)]
pub struct Reconciler {
  shared: Arc<Shared>,
}

impl Reconciler {
  pub(crate) fn new(shared: Arc<Shared>) -> Self {
    Self { shared }
  }

  /// Reconcile one lifecycle event.
  ///
  /// Events for unknown executions (already finished, or never started
  /// here) are ignored. A failing handler drives the affected entry to
  /// `failure` and the error is returned.
  pub async fn reconcile(&self, event: LifecycleEvent) -> Result<()> {
    let executions = &self.shared.executions;
    let execution = if event.state.is_terminal() {
      executions.finish(event.execution)
    } else {
      executions.get(event.execution)
    };

    let Some(execution) = execution else {
      warn!(task = %event.task_id, execution = %event.execution, "lifecycle event for unknown execution");
      return Ok(());
    };

    let descriptor = Arc::clone(&execution.descriptor);
    if descriptor.id != event.task_id {
      warn!(
        task = %event.task_id,
        expected = %descriptor.id,
        execution = %event.execution,
        "lifecycle event task id does not match execution"
      );
    }
    debug!(task = %descriptor.id, execution = %event.execution, state = ?event.state, "reconciling");

    match event.state {
      LifecycleState::Pending => self.apply_progress(&descriptor, &event.payload).await,
      LifecycleState::Success | LifecycleState::Failure => {
        let result = self.apply_terminal(&execution, &event).await;
        self.settle_progress_target(&descriptor, &event).await;
        if execution.claimed {
          executions.in_flight.release(&descriptor.id);
        }
        result
      }
    }
  }

  /// Spawn a task that reconciles every lifecycle event published on the
  /// bus until it closes.
  pub fn spawn(&self) -> JoinHandle<()> {
    // Subscribe before spawning so no event published after this call is
    // missed.
    let mut rx = self.shared.bus.subscribe();
    let reconciler = self.clone();

    tokio::spawn(async move {
      loop {
        match rx.recv().await {
          Ok(BusMessage::Lifecycle(event)) => {
            if let Err(e) = reconciler.reconcile(event).await {
              error!("reconciliation failed: {:#}", e);
            }
          }
          Ok(_) => {}
          Err(RecvError::Lagged(skipped)) => {
            warn!(skipped, "reconciler lagged behind the event bus");
          }
          Err(RecvError::Closed) => break,
        }
      }
    })
  }

  async fn apply_progress(&self, descriptor: &TaskDescriptor, payload: &Value) -> Result<()> {
    let target = &descriptor.progress_target;
    match descriptor.progress(payload) {
      Ok(progress) => {
        // A target that is not pending has nothing to report progress on
        let stored = self
          .shared
          .cache
          .modify_if(target, |current| {
            current.is_pending().then(|| current.update(progress))
          })
          .await?;
        if stored.is_none() {
          debug!(task = %descriptor.id, %target, "progress for settled entry ignored");
        }
        Ok(())
      }
      Err(e) => {
        self.force_failure(descriptor, target, &e).await;
        Err(e.wrap_err(format!("Progress handler for {} failed", descriptor.id)))
      }
    }
  }

  async fn apply_terminal(&self, execution: &Execution, event: &LifecycleEvent) -> Result<()> {
    let descriptor = &execution.descriptor;

    let (outcome, effects) = match event.state {
      LifecycleState::Failure => {
        self.restore_snapshots(execution).await?;
        (Outcome::Failure, descriptor.failure_effects(&event.payload))
      }
      _ => (Outcome::Success, descriptor.success_effects(&event.payload)),
    };

    let effects = match effects {
      Ok(effects) => effects,
      Err(e) => {
        self.force_failure(descriptor, &descriptor.id, &e).await;
        return Err(e.wrap_err(format!(
          "{} handler for {} failed",
          match outcome {
            Outcome::Success => "Success",
            Outcome::Failure => "Failure",
          },
          descriptor.id
        )));
      }
    };

    self.apply_effects(effects, outcome).await
  }

  /// Apply effects in order, each against the cache as left by the
  /// previous one.
  async fn apply_effects(&self, effects: Vec<Effect>, outcome: Outcome) -> Result<()> {
    for effect in effects {
      match effect {
        Effect::Update { id, value } => {
          let now = self.shared.clock.now();
          self
            .shared
            .cache
            .modify(&id, |current| match outcome {
              Outcome::Success => current.succeed(value.resolve(current.data.as_ref()), now),
              Outcome::Failure => current.fail(value.resolve(current.error.as_ref())),
            })
            .await?;
        }
        Effect::Action(action) => {
          self.shared.bus.publish(BusMessage::Action(action)).await?;
        }
      }
    }
    Ok(())
  }

  /// Settle a separate progress target still left pending once the
  /// execution ends: success keeps its data, failure records the payload.
  async fn settle_progress_target(&self, descriptor: &TaskDescriptor, event: &LifecycleEvent) {
    let target = &descriptor.progress_target;
    if *target == descriptor.id {
      return;
    }
    let now = self.shared.clock.now();
    let settled = self
      .shared
      .cache
      .modify_if(target, |current| {
        current.is_pending().then(|| match event.state {
          LifecycleState::Failure => current.fail(event.payload.clone()),
          _ => current.succeed(current.data.clone().unwrap_or(Value::Null), now),
        })
      })
      .await;
    if let Err(e) = settled {
      error!(%target, "failed to settle progress target: {:#}", e);
    }
  }

  async fn restore_snapshots(&self, execution: &Execution) -> Result<()> {
    for (id, previous) in &execution.snapshots {
      debug!(%id, "rolling back optimistic update");
      self.shared.cache.restore(id, previous.clone()).await?;
    }
    Ok(())
  }

  /// Drive `target` to failure after a handler error. Cache errors here
  /// are logged; the handler error is what the caller gets.
  async fn force_failure(
    &self,
    descriptor: &TaskDescriptor,
    target: &Identifier,
    cause: &color_eyre::Report,
  ) {
    error!(task = %descriptor.id, %target, "handler failed: {:#}", cause);
    let error = json!({ "error": cause.to_string() });
    if let Err(e) = self
      .shared
      .cache
      .modify(target, |current| current.fail(error))
      .await
    {
      error!(%target, "failed to record handler failure: {:#}", e);
    }
  }
}
