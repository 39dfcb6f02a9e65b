//! Declarative descriptions of how to obtain or update resources.

mod descriptor;
mod effect;
mod options;

pub use descriptor::{Handler, ProgressHandler, TaskDescriptor};
pub use effect::{Effect, Transform, UpdateValue};
pub use options::{Freshness, TaskOptions};
