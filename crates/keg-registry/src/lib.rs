//! Persistent state for the keg artifact store: the valid-path registry and
//! the path-info disk cache, both SQLite-backed.

pub mod disk_cache;
pub mod error;
pub mod sqlite;

pub use disk_cache::{CacheLookup, DiskCache};
pub use error::{RegistryError, RegistryResult};
pub use sqlite::SqliteRegistry;
