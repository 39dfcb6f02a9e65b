//! Immutable resource snapshots and their lifecycle transitions.
//!
//! A [`Resource`] is never mutated in place. Every transition returns a new
//! value, which lets observers detect changes by comparing snapshots.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  /// Never requested. Only produced by a lookup miss.
  Uninitialized,
  /// A fetch is in progress
  Pending,
  Success,
  Failure,
}

/// Partial-progress counters reported while a fetch is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
  pub loaded: u64,
  #[serde(default)]
  pub total: Option<u64>,
}

/// One cache entry's lifecycle state and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  pub status: Status,
  /// Last successfully received payload
  pub data: Option<Value>,
  /// Last failure payload
  pub error: Option<Value>,
  /// Time of the last successful data update. `None` means never.
  pub last_updated: Option<DateTime<Utc>>,
  /// Start time of the last fetch attempt
  pub last_attempt: Option<DateTime<Utc>>,
  pub loaded: Option<u64>,
  pub total: Option<u64>,
}

static UNINITIALIZED: OnceLock<Arc<Resource>> = OnceLock::new();

impl Resource {
  /// The shared `uninitialized` value returned for every lookup miss.
  ///
  /// All callers receive the same `Arc`, so repeated misses compare as
  /// unchanged by pointer.
  pub fn uninitialized() -> Arc<Resource> {
    Arc::clone(UNINITIALIZED.get_or_init(|| {
      Arc::new(Resource {
        status: Status::Uninitialized,
        data: None,
        error: None,
        last_updated: None,
        last_attempt: None,
        loaded: None,
        total: None,
      })
    }))
  }

  /// `* -> pending`. Keeps data, error and `last_updated` so an in-flight
  /// refresh never blanks loaded content.
  pub fn attempt(&self, now: DateTime<Utc>) -> Resource {
    Resource {
      status: Status::Pending,
      last_attempt: Some(now),
      ..self.clone()
    }
  }

  /// `pending -> pending` with new progress counters.
  ///
  /// Progress is only meaningful while pending; on any other status the
  /// resource is returned unchanged.
  pub fn update(&self, progress: Progress) -> Resource {
    if self.status != Status::Pending {
      return self.clone();
    }
    Resource {
      loaded: Some(progress.loaded),
      total: progress.total,
      ..self.clone()
    }
  }

  /// `* -> success`.
  pub fn succeed(&self, data: Value, now: DateTime<Utc>) -> Resource {
    Resource {
      status: Status::Success,
      data: Some(data),
      error: None,
      last_updated: Some(now),
      last_attempt: Some(now),
      loaded: None,
      total: None,
    }
  }

  /// `* -> failure`. Known-good data and both timestamps survive.
  pub fn fail(&self, error: Value) -> Resource {
    Resource {
      status: Status::Failure,
      error: Some(error),
      ..self.clone()
    }
  }

  /// Elapsed time since the last successful update. `None` means the
  /// resource never succeeded, i.e. it is infinitely stale.
  pub fn staleness(&self, now: DateTime<Utc>) -> Option<Duration> {
    self.last_updated.map(|updated| now - updated)
  }

  pub fn is_pending(&self) -> bool {
    self.status == Status::Pending
  }

  /// Everything but the payload, as handed to renderers under
  /// `data_requests`.
  pub fn metadata(&self) -> ResourceMetadata {
    ResourceMetadata {
      status: self.status,
      error: self.error.clone(),
      last_updated: self.last_updated,
      last_attempt: self.last_attempt,
      loaded: self.loaded,
      total: self.total,
    }
  }
}

/// A [`Resource`] without its `data` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
  pub status: Status,
  pub error: Option<Value>,
  pub last_updated: Option<DateTime<Utc>>,
  pub last_attempt: Option<DateTime<Utc>>,
  pub loaded: Option<u64>,
  pub total: Option<u64>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
  }

  fn samples() -> Vec<Resource> {
    let fresh = Resource::uninitialized();
    let pending = fresh.attempt(t(1));
    let loaded = pending.succeed(json!({"v": 1}), t(2));
    let failed = loaded.attempt(t(3)).fail(json!("boom"));
    let progressing = failed.attempt(t(4)).update(Progress {
      loaded: 3,
      total: Some(10),
    });
    vec![(*fresh).clone(), pending, loaded, failed, progressing]
  }

  #[test]
  fn test_uninitialized_is_singleton() {
    let a = Resource::uninitialized();
    let b = Resource::uninitialized();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.status, Status::Uninitialized);
    assert!(a.data.is_none() && a.error.is_none());
    assert!(a.last_updated.is_none() && a.last_attempt.is_none());
    assert!(a.loaded.is_none() && a.total.is_none());
  }

  #[test]
  fn test_fail_never_touches_data_or_last_updated() {
    for resource in samples() {
      let failed = resource.fail(json!({"code": 500}));
      assert_eq!(failed.status, Status::Failure);
      assert_eq!(failed.data, resource.data);
      assert_eq!(failed.last_updated, resource.last_updated);
      assert_eq!(failed.last_attempt, resource.last_attempt);
      assert_eq!(failed.error, Some(json!({"code": 500})));
    }
  }

  #[test]
  fn test_attempt_only_changes_status_and_last_attempt() {
    for resource in samples() {
      let once = resource.attempt(t(10));
      let twice = once.attempt(t(11));
      for next in [&once, &twice] {
        assert_eq!(next.status, Status::Pending);
        assert_eq!(next.data, resource.data);
        assert_eq!(next.error, resource.error);
        assert_eq!(next.last_updated, resource.last_updated);
      }
      assert_eq!(twice.last_attempt, Some(t(11)));
    }
  }

  #[test]
  fn test_succeed_sets_data_exactly() {
    let payload = json!({"items": [1, 2, 3], "next": null});
    let resource = Resource::uninitialized()
      .attempt(t(0))
      .update(Progress {
        loaded: 1,
        total: None,
      })
      .fail(json!("old"))
      .succeed(payload.clone(), t(5));

    assert_eq!(resource.status, Status::Success);
    assert_eq!(resource.data, Some(payload));
    assert_eq!(resource.error, None);
    assert_eq!(resource.last_updated, Some(t(5)));
    assert_eq!(resource.last_attempt, Some(t(5)));
    assert_eq!(resource.loaded, None);
  }

  #[test]
  fn test_progress_only_while_pending() {
    let pending = Resource::uninitialized().attempt(t(0));
    let progressed = pending.update(Progress {
      loaded: 4,
      total: Some(8),
    });
    assert_eq!(progressed.status, Status::Pending);
    assert_eq!((progressed.loaded, progressed.total), (Some(4), Some(8)));
    assert_eq!(progressed.last_attempt, pending.last_attempt);

    let done = progressed.succeed(json!(1), t(1));
    assert_eq!(
      done.update(Progress {
        loaded: 9,
        total: None
      }),
      done
    );
  }

  #[test]
  fn test_staleness() {
    let never = Resource::uninitialized();
    assert_eq!(never.staleness(t(100)), None);

    let loaded = never.succeed(json!(true), t(40));
    assert_eq!(loaded.staleness(t(100)), Some(Duration::seconds(60)));
  }

  #[test]
  fn test_metadata_omits_data() {
    let resource = Resource::uninitialized().succeed(json!("payload"), t(0));
    let meta = resource.metadata();
    assert_eq!(meta.status, Status::Success);
    let encoded = serde_json::to_value(&meta).unwrap();
    assert!(encoded.get("data").is_none());
  }
}
