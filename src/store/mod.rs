//! Storage for resources.
//!
//! - [`Store`] is the dumb, last-write-wins map backends implement
//! - [`MemoryStore`] keeps resources in process memory
//! - [`SqliteStore`] serializes resources into an in-memory SQLite database,
//!   standing in for a backing medium slower than memory
//! - [`Cache`] is the handle everything else talks to: it resolves misses to
//!   `uninitialized`, serializes writes per identifier and announces changes

mod layer;
mod memory;
mod sqlite;
mod traits;

pub use layer::Cache;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::Store;
