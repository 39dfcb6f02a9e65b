//! Task descriptors: what to emit to start work, and how to interpret the
//! outcome.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::effect::Effect;
use super::options::{Freshness, TaskOptions};
use crate::identifier::Identifier;
use crate::resource::Progress;

/// Maps a success or failure payload to the effects to apply.
pub type Handler = Arc<dyn Fn(&Value) -> Result<Vec<Effect>> + Send + Sync>;

/// Maps a partial-progress payload to progress counters.
pub type ProgressHandler = Arc<dyn Fn(&Value) -> Result<Progress> + Send + Sync>;

/// Declarative description of how to obtain or update one resource.
///
/// # Example
///
/// ```
/// use rescache::{Effect, Identifier, TaskDescriptor};
/// use serde_json::json;
///
/// let id = Identifier::new("user", "42");
/// let task = TaskDescriptor::new(id.clone())
///   .initiate(Effect::action(json!({"get": "/users/42"})))
///   .freshness_millis(30_000);
/// assert_eq!(task.progress_target, id);
/// ```
#[derive(Clone)]
pub struct TaskDescriptor {
  pub id: Identifier,
  /// Effects run when the task starts
  pub initiator: Vec<Effect>,
  pub on_success: Option<Handler>,
  pub on_failure: Option<Handler>,
  /// Entry that partial-progress events update
  pub progress_target: Identifier,
  pub on_partial: Option<ProgressHandler>,
  pub options: TaskOptions,
}

impl TaskDescriptor {
  /// A descriptor with no initiator and default handlers, whose progress
  /// target is its own `id`.
  pub fn new(id: Identifier) -> Self {
    Self {
      progress_target: id.clone(),
      id,
      initiator: Vec::new(),
      on_success: None,
      on_failure: None,
      on_partial: None,
      options: TaskOptions::default(),
    }
  }

  /// Append an effect to the initiator.
  pub fn initiate(mut self, effect: Effect) -> Self {
    self.initiator.push(effect);
    self
  }

  pub fn with_initiator(mut self, effects: Vec<Effect>) -> Self {
    self.initiator = effects;
    self
  }

  pub fn on_success<F>(mut self, handler: F) -> Self
  where
    F: Fn(&Value) -> Result<Vec<Effect>> + Send + Sync + 'static,
  {
    self.on_success = Some(Arc::new(handler));
    self
  }

  pub fn on_failure<F>(mut self, handler: F) -> Self
  where
    F: Fn(&Value) -> Result<Vec<Effect>> + Send + Sync + 'static,
  {
    self.on_failure = Some(Arc::new(handler));
    self
  }

  /// Route partial-progress events to `target` through `handler`. A
  /// separate target goes pending with the task and settles with it.
  pub fn on_partial<F>(mut self, target: Identifier, handler: F) -> Self
  where
    F: Fn(&Value) -> Result<Progress> + Send + Sync + 'static,
  {
    self.progress_target = target;
    self.on_partial = Some(Arc::new(handler));
    self
  }

  pub fn freshness(mut self, freshness: Freshness) -> Self {
    self.options.freshness = Some(freshness);
    self
  }

  pub fn freshness_millis(self, ms: i64) -> Self {
    self.freshness(Freshness::millis(ms))
  }

  /// Fetch once, never refresh.
  pub fn forever(self) -> Self {
    self.freshness(Freshness::Forever)
  }

  pub fn retry_after(mut self, after: Duration) -> Self {
    self.options.retry_after = Some(after);
    self
  }

  pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
    self.options.timeout = Some(timeout);
    self
  }

  /// Undo initiator updates when the task fails.
  pub fn rollback(mut self) -> Self {
    self.options.rollback = true;
    self
  }

  /// Effects for a success payload. Without a handler the payload replaces
  /// the entry at `id`.
  pub fn success_effects(&self, payload: &Value) -> Result<Vec<Effect>> {
    match &self.on_success {
      Some(handler) => handler(payload),
      None => Ok(vec![Effect::update(self.id.clone(), payload.clone())]),
    }
  }

  /// Effects for a failure payload. Without a handler the payload becomes
  /// the error at `id`.
  pub fn failure_effects(&self, payload: &Value) -> Result<Vec<Effect>> {
    match &self.on_failure {
      Some(handler) => handler(payload),
      None => Ok(vec![Effect::update(self.id.clone(), payload.clone())]),
    }
  }

  /// Progress counters for a partial payload. Without a handler the
  /// payload must look like `{"loaded": n, "total": m}`.
  pub fn progress(&self, payload: &Value) -> Result<Progress> {
    match &self.on_partial {
      Some(handler) => handler(payload),
      None => serde_json::from_value(payload.clone())
        .map_err(|e| eyre!("Invalid progress payload for {}: {}", self.id, e)),
    }
  }
}

impl fmt::Debug for TaskDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskDescriptor")
      .field("id", &self.id)
      .field("initiator", &self.initiator)
      .field("progress_target", &self.progress_target)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
