//! Client-side cache for asynchronously fetched resources.
//!
//! Resources live in a [`Cache`] as immutable [`Resource`] snapshots. A
//! [`Dispatcher`] starts [`TaskDescriptor`]s, a transport does the actual
//! work and reports back with [`LifecycleEvent`]s, and a [`Reconciler`]
//! applies those to the cache. [`SubscriptionBinding`]s sit on the consumer
//! side: they diff declared requests against the cache and refetch stale
//! entries, at most one fetch per identifier at a time.

pub mod binding;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod identifier;
pub mod in_flight;
pub mod logging;
pub mod reconciler;
pub mod replay;
pub mod resource;
pub mod store;
pub mod task;

pub use binding::{Perform, Performer, Props, Renderer, SubscriptionBinding};
pub use bus::{BroadcastEventBus, BusMessage, EventBus, ExecutionId, LifecycleEvent, LifecycleState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use dispatcher::Dispatcher;
pub use identifier::Identifier;
pub use in_flight::InFlight;
pub use reconciler::Reconciler;
pub use resource::{Progress, Resource, ResourceMetadata, Status};
pub use store::{Cache, MemoryStore, SqliteStore, Store};
pub use task::{Effect, Freshness, TaskDescriptor, TaskOptions, UpdateValue};
