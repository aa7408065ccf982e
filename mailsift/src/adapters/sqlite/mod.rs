pub mod pool;
pub mod schema;
pub mod messages;
pub mod sync_state;
pub mod skipped;

// Re-export the pool type so callers can do `use crate::adapters::sqlite::DbPool`
// instead of `use crate::adapters::sqlite::pool::DbPool`
pub use pool::DbPool;
