//! Declarative request/perform bindings.
//!
//! A [`SubscriptionBinding`] holds a consumer's declared requests (which
//! resources it wants) and performs (which operations it may trigger). Each
//! observation reads the requested resources, reports only those that
//! changed, keeps performer callbacks stable while their cache keys are,
//! and fetches whatever has gone stale.

use color_eyre::Result;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::bus::ExecutionId;
use crate::dispatcher::Dispatcher;
use crate::identifier::Identifier;
use crate::resource::{Resource, ResourceMetadata};
use crate::task::TaskDescriptor;

/// Builds the descriptor for one invocation of a performer.
pub type PerformerFactory = Arc<dyn Fn(&[Value]) -> TaskDescriptor + Send + Sync>;

/// A declared operation: a factory plus the key that decides when the
/// performer must be rebuilt.
#[derive(Clone)]
pub struct Perform {
  pub cache_key: String,
  pub factory: PerformerFactory,
}

impl Perform {
  pub fn new<F>(cache_key: impl Into<String>, factory: F) -> Self
  where
    F: Fn(&[Value]) -> TaskDescriptor + Send + Sync + 'static,
  {
    Self {
      cache_key: cache_key.into(),
      factory: Arc::new(factory),
    }
  }
}

/// Callback handed to renderers. Calling it builds a descriptor and runs
/// its initiator.
#[derive(Clone)]
pub struct Performer {
  inner: Arc<PerformerInner>,
}

struct PerformerInner {
  factory: PerformerFactory,
  dispatcher: Dispatcher,
}

impl Performer {
  fn new(factory: PerformerFactory, dispatcher: Dispatcher) -> Self {
    Self {
      inner: Arc::new(PerformerInner {
        factory,
        dispatcher,
      }),
    }
  }

  pub async fn call(&self, args: Vec<Value>) -> Result<ExecutionId> {
    let descriptor = (self.inner.factory)(&args);
    self.inner.dispatcher.dispatch(Arc::new(descriptor)).await
  }

  /// Whether both handles are the same callback.
  pub fn ptr_eq(a: &Performer, b: &Performer) -> bool {
    Arc::ptr_eq(&a.inner, &b.inner)
  }
}

impl fmt::Debug for Performer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Performer")
      .field("ptr", &Arc::as_ptr(&self.inner))
      .finish()
  }
}

/// What a renderer receives after an observation with changes.
#[derive(Debug, Clone)]
pub struct Props {
  /// Current resource for every request key
  pub resources: BTreeMap<String, Arc<Resource>>,
  /// Request and perform keys that changed since the last render
  pub changed: BTreeSet<String>,
  pub performers: BTreeMap<String, Performer>,
  /// Request metadata without payloads
  pub data_requests: BTreeMap<String, ResourceMetadata>,
}

impl Props {
  pub fn data(&self, key: &str) -> Option<&Value> {
    self.resources.get(key).and_then(|r| r.data.as_ref())
  }
}

/// The render side of a binding.
pub trait Renderer: Send {
  /// Render new props. Returning `Break` ends the binding's loop.
  fn render(&mut self, props: Props) -> ControlFlow<()>;
}

impl<F> Renderer for F
where
  F: FnMut(Props) -> ControlFlow<()> + Send,
{
  fn render(&mut self, props: Props) -> ControlFlow<()> {
    self(props)
  }
}

/// Diffs a set of declared requests and performs against the cache.
pub struct SubscriptionBinding {
  dispatcher: Dispatcher,
  requests: BTreeMap<String, Arc<TaskDescriptor>>,
  performs: BTreeMap<String, Perform>,
  observed: HashMap<String, Arc<Resource>>,
  performers: HashMap<String, (String, Performer)>,
  rendered: bool,
}

impl SubscriptionBinding {
  pub fn new(dispatcher: Dispatcher) -> Self {
    Self {
      dispatcher,
      requests: BTreeMap::new(),
      performs: BTreeMap::new(),
      observed: HashMap::new(),
      performers: HashMap::new(),
      rendered: false,
    }
  }

  /// Declare a resource under `key`. The descriptor's `id` is what gets
  /// read; its freshness option decides refetching.
  pub fn request(mut self, key: impl Into<String>, descriptor: TaskDescriptor) -> Self {
    self.requests.insert(key.into(), Arc::new(descriptor));
    self
  }

  pub fn perform(mut self, key: impl Into<String>, perform: Perform) -> Self {
    self.performs.insert(key.into(), perform);
    self
  }

  /// Replace the declared requests, e.g. when the consumer's inputs change.
  pub fn set_requests(&mut self, requests: BTreeMap<String, Arc<TaskDescriptor>>) {
    self.requests = requests;
  }

  pub fn set_performs(&mut self, performs: BTreeMap<String, Perform>) {
    self.performs = performs;
  }

  /// Whether a write to `id` can affect this binding.
  pub fn watches(&self, id: &Identifier) -> bool {
    self.requests.values().any(|descriptor| &descriptor.id == id)
  }

  /// Run one observation cycle.
  ///
  /// Returns `None` when nothing changed since the previous cycle. The
  /// first cycle always yields props.
  pub async fn observe(&mut self) -> Result<Option<Props>> {
    let mut changed = BTreeSet::new();

    let mut resources = BTreeMap::new();
    for (key, descriptor) in &self.requests {
      let resource = self.read(&descriptor.id).await;
      let unchanged = self
        .observed
        .get(key)
        .is_some_and(|previous| same_resource(previous, &resource));
      if !unchanged {
        changed.insert(key.clone());
        self.observed.insert(key.clone(), Arc::clone(&resource));
      }
      resources.insert(key.clone(), resource);
    }

    let mut performers = BTreeMap::new();
    for (key, perform) in &self.performs {
      let reusable = self
        .performers
        .get(key)
        .filter(|(cache_key, _)| *cache_key == perform.cache_key)
        .map(|(_, performer)| performer.clone());
      let performer = match reusable {
        Some(performer) => performer,
        None => {
          let performer = Performer::new(Arc::clone(&perform.factory), self.dispatcher.clone());
          self
            .performers
            .insert(key.clone(), (perform.cache_key.clone(), performer.clone()));
          changed.insert(key.clone());
          performer
        }
      };
      performers.insert(key.clone(), performer);
    }

    // Keys that were dropped from the declaration count as changes too
    let requests = &self.requests;
    let performs = &self.performs;
    let before = self.observed.len() + self.performers.len();
    self.observed.retain(|key, _| requests.contains_key(key));
    self.performers.retain(|key, _| performs.contains_key(key));
    let dropped = before != self.observed.len() + self.performers.len();

    self.refresh_stale(&resources).await;

    if self.rendered && changed.is_empty() && !dropped {
      return Ok(None);
    }
    self.rendered = true;

    let data_requests = resources
      .iter()
      .map(|(key, resource)| (key.clone(), resource.metadata()))
      .collect();

    Ok(Some(Props {
      resources,
      changed,
      performers,
      data_requests,
    }))
  }

  /// Observe once, then again after every state change, handing props to
  /// `renderer` whenever something changed. Changes to identifiers outside
  /// the requests only rerun the staleness check.
  pub async fn run<R: Renderer>(mut self, mut renderer: R) -> Result<()> {
    let mut changes = self.dispatcher.cache().subscribe();

    if let Some(props) = self.observe().await? {
      if renderer.render(props).is_break() {
        return Ok(());
      }
    }

    loop {
      match changes.recv().await {
        Ok(id) if !self.watches(&id) => {
          // Nothing to render, but requests may have gone stale meanwhile
          self.refresh().await;
          continue;
        }
        Ok(_) => {}
        Err(RecvError::Lagged(skipped)) => {
          debug!(skipped, "binding lagged, re-observing");
        }
        Err(RecvError::Closed) => return Ok(()),
      }

      if let Some(props) = self.observe().await? {
        if renderer.render(props).is_break() {
          return Ok(());
        }
      }
    }
  }

  async fn read(&self, id: &Identifier) -> Arc<Resource> {
    match self.dispatcher.cache().read(id).await {
      Ok(resource) => resource,
      Err(e) => {
        warn!(%id, "cache read failed, treating as uninitialized: {:#}", e);
        Resource::uninitialized()
      }
    }
  }

  /// Read every request and fetch the stale ones, without diffing.
  async fn refresh(&self) {
    let mut resources = BTreeMap::new();
    for (key, descriptor) in &self.requests {
      resources.insert(key.clone(), self.read(&descriptor.id).await);
    }
    self.refresh_stale(&resources).await;
  }

  /// Fetch every requested resource whose freshness has run out, unless a
  /// fetch for it is already outstanding.
  async fn refresh_stale(&self, resources: &BTreeMap<String, Arc<Resource>>) {
    let now = self.dispatcher.clock().now();
    for (key, descriptor) in &self.requests {
      let Some(resource) = resources.get(key) else {
        continue;
      };
      if !descriptor.options.needs_refresh(resource, now) {
        continue;
      }
      if self.dispatcher.in_flight().contains(&descriptor.id) {
        continue;
      }
      match self.dispatcher.fetch(Arc::clone(descriptor)).await {
        Ok(Some(execution)) => debug!(%key, id = %descriptor.id, %execution, "refetching stale resource"),
        Ok(None) => {}
        Err(e) => error!(%key, id = %descriptor.id, "failed to start fetch: {:#}", e),
      }
    }
  }
}

/// Change detection for immutable resources: the same allocation, or an
/// equal value read back from a serializing store.
fn same_resource(a: &Arc<Resource>, b: &Arc<Resource>) -> bool {
  Arc::ptr_eq(a, b) || a == b
}
