//! Repository metadata database
//!
//! SQLite storage for repository identities and archiving outcomes. Producers
//! use it to resolve endpoints to ids; consumers record every outcome.

pub mod schema;
pub mod store;

pub use schema::{create_database, get_info, keys, set_info};
pub use store::{RepositoryRecord, RepositoryStatus, RepositoryStore, SqliteRepositoryStore};
