pub mod memory;
pub mod models;
pub mod pool;
pub mod queries;
pub mod sqlite_store;

pub use memory::MemoryStore;
pub use sqlite_store::SqliteStore;
