//! End-to-end flows through a fake transport on the event bus.

use chrono::{Duration, Utc};
use rescache::{
  BroadcastEventBus, BusMessage, Cache, Clock, Dispatcher, Effect, EventBus, Identifier, LifecycleEvent,
  ManualClock, Perform, Props, Resource, Status, SubscriptionBinding, TaskDescriptor,
};
use serde_json::{json, Value};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::broadcast::error::RecvError;

/// Answers every dispatched action with `respond(action)`, counting calls.
fn spawn_transport<F>(bus: Arc<BroadcastEventBus>, respond: F) -> Arc<AtomicUsize>
where
  F: Fn(&Value) -> Result<Value, Value> + Send + 'static,
{
  let calls = Arc::new(AtomicUsize::new(0));
  let counter = Arc::clone(&calls);
  let mut rx = bus.subscribe();

  tokio::spawn(async move {
    loop {
      match rx.recv().await {
        Ok(BusMessage::Dispatch {
          task_id,
          execution,
          action,
        }) => {
          counter.fetch_add(1, Ordering::SeqCst);
          let event = match respond(&action) {
            Ok(payload) => LifecycleEvent::success(task_id, execution, payload),
            Err(payload) => LifecycleEvent::failure(task_id, execution, payload),
          };
          let _ = bus.publish(BusMessage::Lifecycle(event)).await;
        }
        Ok(_) | Err(RecvError::Lagged(_)) => {}
        Err(RecvError::Closed) => break,
      }
    }
  });

  calls
}

fn setup(cache: Cache) -> (Dispatcher, Arc<BroadcastEventBus>, Arc<ManualClock>) {
  let bus = Arc::new(BroadcastEventBus::default());
  let clock = Arc::new(ManualClock::new(Utc::now()));
  let dispatcher = Dispatcher::with_clock(cache, bus.clone(), clock.clone());
  (dispatcher, bus, clock)
}

async fn wait_for<F>(cache: &Cache, id: &Identifier, done: F) -> Arc<Resource>
where
  F: Fn(&Resource) -> bool,
{
  tokio::time::timeout(StdDuration::from_secs(5), async {
    loop {
      let resource = cache.read(id).await.unwrap();
      if done(&resource) {
        return resource;
      }
      tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
  })
  .await
  .expect("resource never reached the expected state")
}

#[tokio::test]
async fn test_bound_request_loads_through_transport() {
  let (dispatcher, bus, _) = setup(Cache::memory());
  let _reconciler = dispatcher.reconciler().spawn();
  let calls = spawn_transport(bus, |action| Ok(json!({"echo": action})));

  let id = Identifier::new("user", "1");
  let binding = SubscriptionBinding::new(dispatcher.clone()).request(
    "user",
    TaskDescriptor::new(id.clone())
      .initiate(Effect::action(json!("GET /users/1")))
      .freshness_millis(60_000),
  );

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let handle = tokio::spawn(binding.run(move |props: Props| {
    let loaded = props.resources["user"].status == Status::Success;
    let _ = tx.send(props);
    if loaded {
      ControlFlow::Break(())
    } else {
      ControlFlow::Continue(())
    }
  }));

  let mut last = None;
  while let Some(props) = rx.recv().await {
    last = Some(props);
  }
  handle.await.unwrap().unwrap();

  let props = last.unwrap();
  assert_eq!(props.data("user"), Some(&json!({"echo": "GET /users/1"})));
  assert_eq!(props.data_requests["user"].status, Status::Success);
  assert_eq!(calls.load(Ordering::SeqCst), 1);
  assert!(dispatcher.in_flight().is_empty());
}

#[tokio::test]
async fn test_concurrent_bindings_share_one_fetch() {
  let (dispatcher, bus, clock) = setup(Cache::memory());
  let id = Identifier::new("feed", "home");
  dispatcher
    .cache()
    .write(
      &id,
      Arc::new(Resource::uninitialized().succeed(json!([]), clock.now() - Duration::milliseconds(1500))),
    )
    .await
    .unwrap();
  let calls = spawn_transport(bus, |_| Ok(json!(["post"])));
  let _reconciler = dispatcher.reconciler().spawn();

  let task = TaskDescriptor::new(id.clone())
    .initiate(Effect::action(json!("GET /feed")))
    .freshness_millis(1000);
  let mut bindings: Vec<_> = (0..4)
    .map(|_| SubscriptionBinding::new(dispatcher.clone()).request("feed", task.clone()))
    .collect();

  futures::future::join_all(bindings.iter_mut().map(|b| b.observe())).await;

  let resource = wait_for(dispatcher.cache(), &id, |r| r.status == Status::Success).await;
  assert_eq!(resource.data, Some(json!(["post"])));
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  // Fresh again: no further fetches
  futures::future::join_all(bindings.iter_mut().map(|b| b.observe())).await;
  tokio::time::sleep(StdDuration::from_millis(20)).await;
  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_optimistic_mutation_rolls_back_on_failure() {
  let (dispatcher, bus, clock) = setup(Cache::memory());
  let likes = Identifier::new("likes", "post-1");
  dispatcher
    .cache()
    .write(&likes, Arc::new(Resource::uninitialized().succeed(json!(5), clock.now())))
    .await
    .unwrap();
  spawn_transport(bus, |_| Err(json!("forbidden")));
  let _reconciler = dispatcher.reconciler().spawn();

  let target = likes.clone();
  let mut binding = SubscriptionBinding::new(dispatcher.clone())
    .request("likes", TaskDescriptor::new(likes.clone()))
    .perform(
      "like",
      Perform::new("post-1", move |_| {
        TaskDescriptor::new(Identifier::one_off("like-post-1"))
          .initiate(Effect::transform(target.clone(), |prev| {
            json!(prev.and_then(Value::as_i64).unwrap_or(0) + 1)
          }))
          .initiate(Effect::action(json!({"like": "post-1"})))
          .rollback()
      }),
    );
  let props = binding.observe().await.unwrap().unwrap();

  props.performers["like"].call(Vec::new()).await.unwrap();

  let op = wait_for(
    dispatcher.cache(),
    &Identifier::one_off("like-post-1"),
    |r| r.status == Status::Failure,
  )
  .await;
  assert_eq!(op.error, Some(json!("forbidden")));
  assert_eq!(
    dispatcher.cache().read(&likes).await.unwrap().data,
    Some(json!(5))
  );
}
