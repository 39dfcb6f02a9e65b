//! The event bus shared with the outside world.
//!
//! Transports listen for [`BusMessage::Dispatch`], do the actual work and
//! report back with [`BusMessage::Lifecycle`]. Actions produced by handlers
//! travel as [`BusMessage::Action`].

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

use crate::identifier::Identifier;

/// Default capacity of the broadcast channel.
const DEFAULT_BUS_CAPACITY: usize = 1024;

/// One run of a task descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Phase reported by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  /// Partial progress
  Pending,
  Success,
  Failure,
}

impl LifecycleState {
  pub fn is_terminal(&self) -> bool {
    !matches!(self, LifecycleState::Pending)
  }
}

/// Progress or outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
  pub task_id: Identifier,
  pub execution: ExecutionId,
  pub state: LifecycleState,
  #[serde(default)]
  pub payload: Value,
}

impl LifecycleEvent {
  pub fn partial(task_id: Identifier, execution: ExecutionId, payload: Value) -> Self {
    Self {
      task_id,
      execution,
      state: LifecycleState::Pending,
      payload,
    }
  }

  pub fn success(task_id: Identifier, execution: ExecutionId, payload: Value) -> Self {
    Self {
      task_id,
      execution,
      state: LifecycleState::Success,
      payload,
    }
  }

  pub fn failure(task_id: Identifier, execution: ExecutionId, payload: Value) -> Self {
    Self {
      task_id,
      execution,
      state: LifecycleState::Failure,
      payload,
    }
  }
}

/// Everything that travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum BusMessage {
  /// An initiator action, tagged so the transport can report back
  Dispatch {
    task_id: Identifier,
    execution: ExecutionId,
    action: Value,
  },
  Lifecycle(LifecycleEvent),
  /// Application action emitted by a handler, forwarded verbatim
  Action(Value),
}

/// Async publish/subscribe interface to the application event bus.
#[async_trait]
pub trait EventBus: Send + Sync {
  async fn publish(&self, message: BusMessage) -> Result<()>;

  fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

/// In-process bus on a tokio broadcast channel.
pub struct BroadcastEventBus {
  tx: broadcast::Sender<BusMessage>,
}

impl BroadcastEventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }
}

impl Default for BroadcastEventBus {
  fn default() -> Self {
    Self::new(DEFAULT_BUS_CAPACITY)
  }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
  async fn publish(&self, message: BusMessage) -> Result<()> {
    // Nobody listening is not an error
    let _ = self.tx.send(message);
    Ok(())
  }

  fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_broadcast_bus_delivers_message() {
    let bus = BroadcastEventBus::new(16);
    let mut rx = bus.subscribe();

    bus
      .publish(BusMessage::Action(json!({"type": "toast"})))
      .await
      .unwrap();

    assert_eq!(
      rx.recv().await.unwrap(),
      BusMessage::Action(json!({"type": "toast"}))
    );
  }

  #[tokio::test]
  async fn test_publish_without_subscribers_is_ok() {
    let bus = BroadcastEventBus::default();
    bus
      .publish(BusMessage::Action(json!(null)))
      .await
      .unwrap();
  }

  #[test]
  fn test_lifecycle_wire_shape() {
    let event: BusMessage = serde_json::from_value(json!({
      "kind": "lifecycle",
      "body": {
        "task_id": {"category": "user", "key": "1"},
        "execution": 3,
        "state": "success",
        "payload": {"name": "ada"}
      }
    }))
    .unwrap();

    assert_eq!(
      event,
      BusMessage::Lifecycle(LifecycleEvent::success(
        Identifier::new("user", "1"),
        ExecutionId(3),
        json!({"name": "ada"})
      ))
    );
  }
}
