//! Effects produced by initiators and lifecycle handlers.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::identifier::Identifier;

/// Computes a new value from the previous one (`None` if there was none).
pub type Transform = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

/// The value side of an [`Effect::Update`].
#[derive(Clone)]
pub enum UpdateValue {
  Literal(Value),
  Transform(Transform),
}

impl UpdateValue {
  /// Resolve against the previous value at the target.
  pub fn resolve(&self, previous: Option<&Value>) -> Value {
    match self {
      UpdateValue::Literal(value) => value.clone(),
      UpdateValue::Transform(transform) => transform(previous),
    }
  }
}

impl fmt::Debug for UpdateValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      UpdateValue::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
      UpdateValue::Transform(_) => f.write_str("Transform(..)"),
    }
  }
}

/// Either a write to the cache or an action for the event bus.
#[derive(Debug, Clone)]
pub enum Effect {
  Update { id: Identifier, value: UpdateValue },
  /// Forwarded verbatim to the event bus
  Action(Value),
}

impl Effect {
  /// Replace the value at `id`.
  pub fn update(id: Identifier, value: Value) -> Self {
    Effect::Update {
      id,
      value: UpdateValue::Literal(value),
    }
  }

  /// Derive the value at `id` from its previous value.
  pub fn transform<F>(id: Identifier, transform: F) -> Self
  where
    F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
  {
    Effect::Update {
      id,
      value: UpdateValue::Transform(Arc::new(transform)),
    }
  }

  pub fn action(payload: Value) -> Self {
    Effect::Action(payload)
  }
}
