//! Refresh options carried by task descriptors.

use chrono::Duration;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::resource::{Resource, Status};

/// How long a successfully fetched resource stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  Within(Duration),
  /// Immutable data: never refetched after one success
  Forever,
}

impl Freshness {
  pub fn millis(ms: i64) -> Self {
    Freshness::Within(Duration::milliseconds(ms))
  }

  /// Whether `resource` can be served without refetching at `now`.
  pub fn is_fresh(&self, resource: &Resource, now: chrono::DateTime<chrono::Utc>) -> bool {
    match self {
      Freshness::Forever => resource.last_updated.is_some(),
      Freshness::Within(tolerance) => resource
        .staleness(now)
        .is_some_and(|staleness| staleness < *tolerance),
    }
  }
}

impl Serialize for Freshness {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Freshness::Within(d) => serializer.serialize_i64(d.num_milliseconds()),
      Freshness::Forever => serializer.serialize_str("forever"),
    }
  }
}

impl<'de> Deserialize<'de> for Freshness {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
      Millis(i64),
      Word(String),
    }

    match Raw::deserialize(deserializer)? {
      Raw::Millis(ms) if ms >= 0 => Ok(Freshness::millis(ms)),
      Raw::Millis(ms) => Err(de::Error::custom(format!(
        "freshness must not be negative, got {}",
        ms
      ))),
      Raw::Word(word) if word.eq_ignore_ascii_case("forever") => Ok(Freshness::Forever),
      Raw::Word(word) => Err(de::Error::custom(format!(
        "expected milliseconds or \"forever\", got {:?}",
        word
      ))),
    }
  }
}

/// Options controlling when and how a task runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
  /// Staleness tolerance. Requests without one are never refetched
  /// automatically.
  pub freshness: Option<Freshness>,
  /// After a failed attempt, wait this long before fetching again.
  pub retry_after: Option<Duration>,
  /// Fail the execution if no terminal event arrives in time.
  pub timeout: Option<std::time::Duration>,
  /// Restore initiator update targets to their prior values on failure.
  pub rollback: bool,
}

impl TaskOptions {
  /// Whether a request with these options should fetch `resource` at `now`.
  ///
  /// Requests without a freshness tolerance never trigger on their own.
  pub fn needs_refresh(&self, resource: &Resource, now: chrono::DateTime<chrono::Utc>) -> bool {
    let Some(freshness) = &self.freshness else {
      return false;
    };
    if freshness.is_fresh(resource, now) {
      return false;
    }
    if let (Some(retry_after), Status::Failure, Some(attempted)) =
      (self.retry_after, resource.status, resource.last_attempt)
    {
      if now - attempted < retry_after {
        return false;
      }
    }
    true
  }
}
