//! Scripted sessions against the cache.
//!
//! A script declares requests for one binding and a list of steps. The
//! clock is manual, so staleness is driven by explicit `advance` steps.
//!
//! ```yaml
//! requests:
//!   profile: { id: { category: user, key: "1" }, freshness: 1000 }
//! steps:
//!   - observe
//!   - lifecycle: { task_id: { category: user, key: "1" }, execution: 1, state: success, payload: { name: ada } }
//!   - advance: 1500
//!   - observe
//! ```

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{error, info};

use crate::binding::SubscriptionBinding;
use crate::bus::{BroadcastEventBus, BusMessage, EventBus, LifecycleEvent};
use crate::clock::ManualClock;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::identifier::Identifier;
use crate::resource::Resource;
use crate::task::{Effect, Freshness, TaskDescriptor};

#[derive(Debug, Clone, Deserialize)]
pub struct Script {
  /// Clock start; defaults to the current time
  #[serde(default)]
  pub start: Option<DateTime<Utc>>,
  #[serde(default)]
  pub requests: BTreeMap<String, TaskSpec>,
  pub steps: Vec<Step>,
}

/// A task descriptor as written in a script. Updates are literal only.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
  pub id: Identifier,
  #[serde(default)]
  pub freshness: Option<Freshness>,
  #[serde(default)]
  pub initiator: Vec<EffectSpec>,
  #[serde(default)]
  pub rollback: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffectSpec {
  Update { id: Identifier, value: Value },
  Action(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
  /// Run one observation of the script's binding
  Observe,
  /// Fetch unless already in flight
  Fetch(TaskSpec),
  /// Run unconditionally
  Dispatch(TaskSpec),
  Lifecycle(LifecycleEvent),
  /// Move the clock forward, in milliseconds
  Advance(i64),
}

impl TaskSpec {
  fn to_descriptor(&self, config: &Config) -> TaskDescriptor {
    let initiator = self
      .initiator
      .iter()
      .map(|effect| match effect {
        EffectSpec::Update { id, value } => Effect::update(id.clone(), value.clone()),
        EffectSpec::Action(action) => Effect::action(action.clone()),
      })
      .collect();

    let mut descriptor = TaskDescriptor::new(self.id.clone()).with_initiator(initiator);
    descriptor.options.freshness = self.freshness;
    descriptor.options.rollback = self.rollback;
    config.defaults.apply(&mut descriptor.options);
    descriptor
  }
}

impl Script {
  pub fn load(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read script {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse script {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }
}

/// Run `script` and return every stored entry afterwards, keyed by the
/// identifier's display form.
///
/// Reconciliation errors are logged and the script continues; they are
/// already reflected in the affected resources.
pub async fn run(script: &Script, config: &Config) -> Result<BTreeMap<String, Arc<Resource>>> {
  let clock = Arc::new(ManualClock::new(script.start.unwrap_or_else(Utc::now)));
  let bus = Arc::new(BroadcastEventBus::new(config.bus_capacity));
  let mut messages = bus.subscribe();
  let dispatcher = Dispatcher::with_clock(config.open_cache()?, bus, clock.clone());
  let reconciler = dispatcher.reconciler();

  let mut binding = SubscriptionBinding::new(dispatcher.clone());
  for (key, spec) in &script.requests {
    binding = binding.request(key.clone(), spec.to_descriptor(config));
  }

  for (index, step) in script.steps.iter().enumerate() {
    match step {
      Step::Observe => match binding.observe().await? {
        Some(props) => info!(step = index, changed = ?props.changed, "observed changes"),
        None => info!(step = index, "observed no changes"),
      },
      Step::Fetch(spec) => {
        let execution = dispatcher
          .fetch(Arc::new(spec.to_descriptor(config)))
          .await?;
        info!(step = index, id = %spec.id, ?execution, "fetch");
      }
      Step::Dispatch(spec) => {
        let execution = dispatcher
          .dispatch(Arc::new(spec.to_descriptor(config)))
          .await?;
        info!(step = index, id = %spec.id, %execution, "dispatch");
      }
      Step::Lifecycle(event) => {
        if let Err(e) = reconciler.reconcile(event.clone()).await {
          error!(step = index, "reconciliation failed: {:#}", e);
        }
      }
      Step::Advance(ms) => clock.advance(Duration::milliseconds(*ms)),
    }

    drain(&mut messages, index);
  }

  Ok(
    dispatcher
      .cache()
      .entries()
      .await?
      .into_iter()
      .map(|(id, resource)| (id.to_string(), resource))
      .collect(),
  )
}

fn drain(messages: &mut tokio::sync::broadcast::Receiver<BusMessage>, step: usize) {
  loop {
    match messages.try_recv() {
      Ok(message) => info!(step, ?message, "bus"),
      Err(TryRecvError::Lagged(skipped)) => info!(step, skipped, "bus messages dropped"),
      Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
    }
  }
}
