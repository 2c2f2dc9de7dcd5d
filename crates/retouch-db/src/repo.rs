//! Store traits and PostgreSQL implementations.

pub mod content;
pub mod job;

pub use content::{ContentStore, PgContentStore};
pub use job::{JobStore, PgJobStore};
