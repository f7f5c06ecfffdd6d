pub mod migrations;
pub mod models;
pub mod queries;
pub mod sqlite;

pub use queries::{StoredStamp, Table};
pub use sqlite::{Database, IntegrityReport};
