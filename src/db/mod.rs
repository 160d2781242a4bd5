//! Database layer: pool and message repository for PostgreSQL.

mod pool;
mod repositories;

pub use pool::{create_pool, ensure_schema, DbPool};
pub use repositories::*;
